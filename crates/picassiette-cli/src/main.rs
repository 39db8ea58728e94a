//! Picassiette.
//!
//! A command line front end for the picassiette cache. It fetches local files and HTTP resources
//! through the two cache tiers, and can wipe the persistent store.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;
mod producer;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
