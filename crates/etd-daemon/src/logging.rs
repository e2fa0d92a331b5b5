//! Logger bootstrap. Maps the `-m` verbosity flag onto an `env_logger`
//! filter before any socket is opened, mirroring `etd.cc`'s order of
//! operations (log level parsed and applied before the listeners bind).

use log::LevelFilter;

/// `-1` silences everything, `5` is the most verbose (`Trace`); anything
/// outside `[-1,5]` is clamped rather than rejected.
pub fn init(verbosity: i8) {
    let filter = match verbosity.clamp(-1, 5) {
        -1 => LevelFilter::Off,
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_verbosity() {
        // Exercised indirectly: init() can only run once per process, so
        // this test just checks the clamp logic the match arms rely on.
        assert_eq!((-5i8).clamp(-1, 5), -1);
        assert_eq!(9i8.clamp(-1, 5), 5);
    }
}
