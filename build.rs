//! Build script.
//!
//! Recompiles when migration files change, which the `SQLx` `migrate!()`
//! macros need to pick up schema changes for the transaction log and the
//! queue stores.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
