use log::LevelFilter;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::NResult;

/// Turn a `loglevel` config value into something `log` understands
pub fn parse_level(levelstr: &str) -> Option<LevelFilter> {
    match levelstr.to_lowercase().as_ref() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// a simple wrapper (pretty much direct from documentation) that sets up
/// logging to STDOUT via fern/log
pub fn setup_logger() -> NResult<()> {
    let levelstr: String = config::get_opt(&["loglevel"]).unwrap_or_else(|| String::from("warn"));
    let level = match parse_level(&levelstr) {
        Some(x) => x,
        None => {
            println!("notesync: config: bad `loglevel` value (\"{}\"), defaulting to \"warn\"", levelstr);
            LevelFilter::Warn
        }
    };
    let res = fern::Dispatch::new()
        .format(|out, message, record| {
            let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
            let now = OffsetDateTime::now_utc()
                .format(&format)
                .unwrap_or_else(|_| String::from("????-??-?? ??:??:??"));
            out.finish(format_args!("[{}][{}][{}] {}", now, record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();
    match res {
        Ok(_) => {}
        // somebody already set a logger (tests, mainly). that's fine.
        Err(_) => return Ok(()),
    }
    log_panics::init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }
}
