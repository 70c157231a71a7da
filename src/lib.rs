//! Keeps a local note database in line with a remote note service, for the
//! primary account and every linked notebook shared with it.
//!
//! Hand a `SyncEngine` a local store, a way to reach note stores and a place
//! to keep tokens, then `run()` it (or `sync::start()` it in the background).

#![recursion_limit="128"]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;

#[macro_use]
pub mod util;
#[macro_use]
pub mod error;
#[macro_use]
pub mod models;
pub mod api;
pub mod storage;
pub mod credentials;
pub mod messaging;
pub mod sync;

use jedi::Value;

pub use crate::error::{NError, NResult, ErrorClass};
pub use crate::sync::{SyncEngine, SyncSettings};
pub use crate::sync::report::SyncReport;

/// Init any state/logging/etc the app needs.
///
/// Takes a JSON-encoded runtime config. If it has a `config_file` key, that
/// file gets loaded as the app config, and everything in the runtime config
/// is merged over the top of it (so callers can override any value).
pub fn init(config_str: &str) -> NResult<()> {
    let runtime_config: Value = match jedi::parse(config_str) {
        Ok(x) => x,
        Err(e) => {
            println!("Problem parsing runtime config: {}", e);
            json!({})
        }
    };
    let config_location: Option<String> = jedi::get_opt(&["config_file"], &runtime_config);
    config::load_config(config_location)?;
    config::merge(&runtime_config)?;
    match util::logger::setup_logger() {
        Ok(_) => {}
        Err(e) => {
            println!("Problem setting up logging: {}", e);
            return NErr!(toterr!(e));
        }
    };
    info!("init() -- notesync ready");
    Ok(())
}
