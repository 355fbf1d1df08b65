//! Job commands.

use anyhow::{Context, Result};
use jobmesh_config::parse_job_file;
use jobmesh_core::Job;
use jobmesh_db::{JobRepo, PgJobOrm};
use std::path::Path;

use super::parse_id;

fn claim_summary(job: &Job) -> String {
    match &job.claim {
        Some(claim) => format!("claimed by {} at {}", claim.claimed_by, claim.claimed_at),
        None => "unclaimed".to_string(),
    }
}

pub async fn create(store: &PgJobOrm, path: &Path) -> Result<()> {
    let new_job = parse_job_file(path)
        .with_context(|| format!("Failed to parse job definition: {}", path.display()))?;
    let job = store.create_job(new_job).await?;
    println!("Created job {} ({})", job.name, job.id);
    Ok(())
}

pub async fn show(store: &PgJobOrm, id: &str) -> Result<()> {
    let job = store.find_job(parse_id(id)?).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn list(store: &PgJobOrm, offset: i64, limit: i64) -> Result<()> {
    let (jobs, total) = store.jobs_v2(offset, limit).await?;
    println!("Jobs {}-{} of {}", offset, offset + jobs.len() as i64, total);
    for job in &jobs {
        println!(
            "  {}  {:<24} {:<14} {}",
            job.id,
            job.name,
            job.job_type,
            claim_summary(job)
        );
    }
    Ok(())
}

pub async fn delete(store: &PgJobOrm, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    store.delete_job(id).await?;
    println!("Deleted job {}", id);
    Ok(())
}

pub async fn bridge(store: &PgJobOrm, name: &str) -> Result<()> {
    let ids = store.find_job_ids_with_bridge(name).await?;
    if ids.is_empty() {
        println!("No jobs use bridge '{}'", name);
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}
