//! Tracing subscriber setup for hosts and demos.
//!
//! `RTCORE_LOG` takes an `EnvFilter` directive (default `info`). With the
//! `chrome-trace` feature, `RTCORE_TRACE=1` also writes `trace.json` for
//! chrome://tracing.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Keeps the chrome trace file open; flushes on drop.
#[derive(Default)]
pub struct TraceGuard {
    #[cfg(feature = "chrome-trace")]
    _chrome: Option<tracing_chrome::FlushGuard>,
}

impl std::fmt::Debug for TraceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceGuard").finish_non_exhaustive()
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() -> TraceGuard {
    let filter = EnvFilter::try_from_env("RTCORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    #[cfg(feature = "chrome-trace")]
    {
        if std::env::var("RTCORE_TRACE").ok().as_deref() == Some("1") {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file("trace.json")
                .build();
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(chrome_layer);
            if tracing::subscriber::set_global_default(subscriber).is_err() {
                return TraceGuard::default();
            }
            return TraceGuard { _chrome: Some(guard) };
        }
    }

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    TraceGuard::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        let _a = init_tracing();
        let _b = init_tracing();
        tracing::info!("still logging");
    }
}
