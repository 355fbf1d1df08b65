//! Run commands.

use anyhow::Result;
use jobmesh_db::{PgJobOrm, RunRepo};

use super::parse_id;

pub async fn list(store: &PgJobOrm, job: Option<&str>, offset: i64, limit: i64) -> Result<()> {
    let (runs, total) = match job {
        Some(job) => {
            store
                .pipeline_runs_by_job_id(parse_id(job)?, offset, limit)
                .await?
        }
        None => store.pipeline_runs(offset, limit).await?,
    };

    println!("Runs {}-{} of {}", offset, offset + runs.len() as i64, total);
    for run in &runs {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  job {}  {:<9} started {}  finished {}",
            run.id,
            run.job_id,
            run.status,
            run.created_at.to_rfc3339(),
            finished
        );
        if let Some(error) = &run.error {
            println!("      error: {}", error);
        }
    }
    Ok(())
}
