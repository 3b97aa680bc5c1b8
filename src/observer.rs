//! Progress reporting hooks.
//!
//! Analyses never branch on what an observer does with a message; the observer
//! only decides whether and where a message is shown.

/// Ordered verbosity levels. A message is delivered when its level is at or
/// below the observer's configured level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    Quiet = 0,
    /// One line per cell/trial.
    Progress = 1,
    /// Per-candidate decisions (rejected fits, skipped windows).
    Detail = 2,
    /// Fit internals.
    Trace = 3,
}

impl Verbosity {
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Verbosity::Quiet,
            1 => Verbosity::Progress,
            2 => Verbosity::Detail,
            _ => Verbosity::Trace,
        }
    }
}

pub trait AnalysisObserver: Send + Sync {
    fn verbosity(&self) -> Verbosity;
    fn notify(&self, level: Verbosity, message: &str);
}

/// Formats and forwards a message only when the observer wants that level.
pub fn emit<F>(observer: &dyn AnalysisObserver, level: Verbosity, message: F)
where
    F: FnOnce() -> String,
{
    if level != Verbosity::Quiet && level <= observer.verbosity() {
        observer.notify(level, &message());
    }
}

/// Forwards to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver {
    pub verbosity: Verbosity,
}

impl LogObserver {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl AnalysisObserver for LogObserver {
    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }
    fn notify(&self, level: Verbosity, message: &str) {
        match level {
            Verbosity::Quiet => {}
            Verbosity::Progress => log::info!("{message}"),
            Verbosity::Detail => log::debug!("{message}"),
            Verbosity::Trace => log::trace!("{message}"),
        }
    }
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentObserver;

impl AnalysisObserver for SilentObserver {
    fn verbosity(&self) -> Verbosity {
        Verbosity::Quiet
    }
    fn notify(&self, _level: Verbosity, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    struct Collect {
        level: Verbosity,
        seen: Mutex<Vec<(Verbosity, String)>>,
    }
    impl AnalysisObserver for Collect {
        fn verbosity(&self) -> Verbosity {
            self.level
        }
        fn notify(&self, level: Verbosity, message: &str) {
            self.seen.lock().unwrap().push((level, message.to_owned()));
        }
    }
    #[test]
    fn emit_respects_levels() {
        let obs = Collect {
            level: Verbosity::Progress,
            seen: Mutex::new(Vec::new()),
        };
        emit(&obs, Verbosity::Progress, || "cell 1".into());
        emit(&obs, Verbosity::Detail, || unreachable!("not formatted"));
        let seen = obs.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "cell 1");
    }
    #[test]
    fn levels_map_from_integers() {
        assert_eq!(Verbosity::from_level(0), Verbosity::Quiet);
        assert_eq!(Verbosity::from_level(2), Verbosity::Detail);
        assert_eq!(Verbosity::from_level(9), Verbosity::Trace);
        assert!(Verbosity::Progress < Verbosity::Trace);
    }
}
