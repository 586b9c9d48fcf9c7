//! The IMDb movie pipeline: per genre ingest, convert and load, then a ranked
//! union of every genre table and a row-count check.

use super::definition::{PipelineDefinition, TaskAction, TaskSpec};
use crate::config::{ExecutionConfig, MoviePipelineConfig};
use crate::connectors::normalize::sanitize_column;
use crate::error::PipelineError;
use crate::types::TaskId;

pub const TRANSFORM_TOP: &str = "transform_top";
pub const VALIDATE_TOP: &str = "validate_top";

pub fn ingest_task(category: &str) -> String {
    format!("ingest_{}", category)
}

pub fn convert_task(category: &str) -> String {
    format!("convert_{}", category)
}

pub fn load_task(category: &str) -> String {
    format!("load_{}", category)
}

/// Warehouse table holding one category
pub fn category_table(config: &MoviePipelineConfig, category: &str) -> String {
    format!("{}.{}", config.dataset, sanitize_column(category))
}

pub fn top_table(config: &MoviePipelineConfig) -> String {
    format!("{}.{}", config.dataset, config.top_table)
}

/// Build the movie pipeline definition
pub fn movie_pipeline(
    config: &MoviePipelineConfig,
    execution: &ExecutionConfig,
) -> Result<PipelineDefinition, PipelineError> {
    if config.categories.is_empty() {
        return Err(PipelineError::InvalidTask {
            task: TaskId::new(TRANSFORM_TOP),
            reason: "no categories to combine".to_string(),
        });
    }

    let mut builder = PipelineDefinition::builder(&config.name, &config.version).execution(execution);

    let mut transform = TaskSpec::new(
        TRANSFORM_TOP,
        TaskAction::Transform {
            sql: top_sql(config),
        },
    );

    for category in &config.categories {
        let ingest = ingest_task(category);
        let convert = convert_task(category);
        let load = load_task(category);

        builder = builder
            .task(TaskSpec::new(
                &ingest,
                TaskAction::Ingest {
                    partition: category.clone(),
                },
            ))
            .task(
                TaskSpec::new(
                    &convert,
                    TaskAction::Convert {
                        partition: category.clone(),
                    },
                )
                .after(&ingest),
            )
            .task(
                TaskSpec::new(
                    &load,
                    TaskAction::Load {
                        partition: category.clone(),
                        target_table: category_table(config, category),
                    },
                )
                .after(&convert),
            );

        transform = transform.after(&load);
    }

    builder
        .task(transform)
        .task(
            TaskSpec::new(
                VALIDATE_TOP,
                TaskAction::Validate {
                    sql: format!("SELECT COUNT(*) FROM {}", top_table(config)),
                    min_rows: config.min_rows,
                },
            )
            .after(TRANSFORM_TOP),
        )
        .build()
}

fn top_sql(config: &MoviePipelineConfig) -> String {
    let selects: Vec<String> = config
        .categories
        .iter()
        .map(|c| format!("SELECT * FROM {}", category_table(config, c)))
        .collect();

    format!(
        "CREATE OR REPLACE TABLE {} AS {} ORDER BY {} DESC LIMIT {}",
        top_table(config),
        selects.join(" UNION ALL "),
        config.order_by,
        config.top_n
    )
}
