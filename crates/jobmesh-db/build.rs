//! Rebuild when migrations change.
//!
//! `sqlx::migrate!` embeds the files under `migrations/` at compile time,
//! so adding a migration must trigger a rebuild of this crate.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
