//! App-wide configuration. Values live in one big JSON tree loaded from a yaml
//! file (`NOTESYNC_CONFIG_FILE`, defaulting to `config.yaml`) and can be
//! overridden at runtime via `merge()`/`set()`.

#[macro_use]
extern crate lazy_static;

use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::sync::RwLock;

use jedi::{DeserializeOwned, JSONError, Serialize, Value};

pub type CResult<T> = Result<T, JSONError>;

lazy_static! {
    /// create a static/global CONFIG var, and load it with our config data
    static ref CONFIG: RwLock<Value> = {
        let path = env::var("NOTESYNC_CONFIG_FILE").unwrap_or_else(|_| String::from("config.yaml"));
        match read_config(&path) {
            Ok(x) => RwLock::new(x),
            Err(_) => RwLock::new(jedi::obj()),
        }
    };
}

/// load/parse a config file, and return the parsed JSON value. a file that
/// doesn't exist is an empty config, everything has a default anyway.
fn read_config(location: &str) -> CResult<Value> {
    let path = Path::new(location);
    if !path.exists() {
        return Ok(jedi::obj());
    }
    let mut file = File::open(&path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    jedi::parse_yaml(&contents)
}

/// (Re)load our config from the given file location (or from the environment
/// if None), replacing whatever we had before.
pub fn load_config(location: Option<String>) -> CResult<()> {
    let location = match location {
        Some(x) => x,
        None => env::var("NOTESYNC_CONFIG_FILE").unwrap_or_else(|_| String::from("config.yaml")),
    };
    let data = read_config(&location)?;
    let mut guard = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    *guard = data;
    Ok(())
}

/// get a value from our config
pub fn get<T: DeserializeOwned>(keys: &[&str]) -> CResult<T> {
    let guard = CONFIG.read().unwrap_or_else(|e| e.into_inner());
    jedi::get(keys, &guard)
}

/// get a value from our config, or None if it's missing (or the wrong type)
pub fn get_opt<T: DeserializeOwned>(keys: &[&str]) -> Option<T> {
    get(keys).ok()
}

/// Set a value into our heroic config
pub fn set<T: Serialize>(keys: &[&str], val: &T) -> CResult<()> {
    let mut guard = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    jedi::set(keys, &mut guard, val)
}

/// Merge a tree of values over the top of our config
pub fn merge(data: &Value) -> CResult<()> {
    let mut guard = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    jedi::merge(&mut guard, data);
    Ok(())
}
