//! Assemble the image from the base image, its layers and the application layers.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kiln_common::KilnResult;
use kiln_image::Image;
use kiln_oci::image::{EmptyObject, ExecutionConfig, HistoryEntry};

use super::{BaseImage, LayerSteps};
use crate::config::ContainerSettings;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "build image";

/// Creation time of reproducible images.
pub const EPOCH: &str = "1970-01-01T00:00:00Z";

const AUTHOR: &str = "Kiln";

/// Assemble the image once the base image and every layer are available.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    base_image: StepHandle<BaseImage>,
    base_layers: StepHandle<LayerSteps>,
    application_layers: StepHandle<LayerSteps>,
) -> StepHandle<Image> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let base = base_image.wait_for(NAME).await?;
        let base_layers = base_layers.wait_for(NAME).await?.cached_layers(NAME).await?;
        let application_layers = application_layers
            .wait_for(NAME)
            .await?
            .cached_layers(NAME)
            .await?;
        let _timer = StepTimer::start(ctx.events(), NAME);

        let config = &ctx.config;
        let mut image = match &base.config {
            Some(base_config) => Image::from_base(config.format, base_config),
            None => Image::new(config.format),
        };

        let created = if config.reproducible {
            EPOCH.to_string()
        } else {
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        };
        for layer in &config.layers {
            image.history.push(HistoryEntry {
                created: Some(created.clone()),
                author: Some(AUTHOR.to_string()),
                created_by: Some(format!("kiln:{}", layer.name)),
                ..HistoryEntry::default()
            });
        }
        image.created = Some(created);
        image.layers = base_layers;
        image.layers.extend(application_layers);
        apply_settings(&mut image.execution, &config.container)?;

        tracing::info!(
            layers = image.layers.len(),
            format = ?image.format,
            "Built image"
        );
        progress.close();
        Ok(image)
    })
}

/// Override inherited execution settings with the configured ones.
fn apply_settings(execution: &mut ExecutionConfig, settings: &ContainerSettings) -> KilnResult<()> {
    if let Some(entrypoint) = &settings.entrypoint {
        // A new entrypoint invalidates the inherited command.
        execution.entrypoint = Some(entrypoint.clone());
        execution.cmd.clone_from(&settings.cmd);
    } else if let Some(cmd) = &settings.cmd {
        execution.cmd = Some(cmd.clone());
    }

    if !settings.environment.is_empty() {
        let env = execution.env.get_or_insert_with(Vec::new);
        for (name, value) in &settings.environment {
            let prefix = format!("{name}=");
            let entry = format!("{name}={value}");
            match env.iter_mut().find(|e| e.starts_with(&prefix)) {
                Some(existing) => *existing = entry,
                None => env.push(entry),
            }
        }
    }

    if settings.working_directory.is_some() {
        execution.working_dir.clone_from(&settings.working_directory);
    }
    if settings.user.is_some() {
        execution.user.clone_from(&settings.user);
    }

    let ports = settings.exposed_ports()?;
    if !ports.is_empty() {
        execution.exposed_ports.get_or_insert_with(BTreeMap::new).extend(ports);
    }
    if !settings.volumes.is_empty() {
        execution
            .volumes
            .get_or_insert_with(BTreeMap::new)
            .extend(settings.volumes.iter().map(|v| (v.clone(), EmptyObject {})));
    }
    if !settings.labels.is_empty() {
        execution
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(settings.labels.clone());
    }
    Ok(())
}
