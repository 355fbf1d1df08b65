//! Job error commands.

use anyhow::Result;
use jobmesh_db::{JobErrorRepo, PgJobOrm};

use super::parse_id;

pub async fn list(store: &PgJobOrm, job: &str) -> Result<()> {
    let errors = store.job_errors(parse_id(job)?).await?;
    if errors.is_empty() {
        println!("No undismissed errors");
    }
    for error in &errors {
        println!(
            "  {}  x{:<4} last {}  {}",
            error.id,
            error.occurrences,
            error.updated_at.to_rfc3339(),
            error.description
        );
    }
    Ok(())
}

pub async fn dismiss(store: &PgJobOrm, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    store.dismiss_error(id).await?;
    println!("Dismissed error {}", id);
    Ok(())
}
