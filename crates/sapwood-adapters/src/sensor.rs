//! Assertion sensor: re-runs an assertion until it passes.

use sapwood::{
    ASSERTION_SENSOR, Adapter, AdapterDecl, AdapterError, AdapterOutput, AdapterRole,
    MaterializeError, Options, TaskContext, Value,
};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_POKE_INTERVAL_SECS: u64 = 60;

/// Polls an assertion query.
///
/// Options: `timeout_secs` (default one hour) and `poke_interval_secs`
/// (default one minute). A dry run checks once.
pub struct AssertionSensor;

fn seconds(options: &Options, key: &str, default: u64) -> Result<Duration, AdapterError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(Duration::from_secs(default)),
        Some(Value::Int(n)) if *n >= 0 => Ok(Duration::from_secs(*n as u64)),
        Some(other) => Err(AdapterError::InvalidOptions(format!(
            "{} must be a non-negative integer, got {}",
            key, other
        ))),
    }
}

impl Adapter for AssertionSensor {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(ASSERTION_SENSOR)
                .description("Wait until every row of an assertion query passes")
                .role(AdapterRole::Sensor)
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let timeout = seconds(&ctx.task.options, "timeout_secs", DEFAULT_TIMEOUT_SECS)?;
        let poke_interval = seconds(
            &ctx.task.options,
            "poke_interval_secs",
            DEFAULT_POKE_INTERVAL_SECS,
        )?;
        let sql = ctx.sql()?;
        let runner = ctx.services.query_runner();
        let start = Instant::now();

        let mut attempt = 1u32;
        loop {
            match runner.assertion(&sql) {
                Ok(_) => {
                    info!(task = %ctx.task.identifier, attempt, "assertion passed");
                    return Ok(AdapterOutput::Completed);
                }
                Err(MaterializeError::AssertionFailed { failed, total }) => {
                    if runner.is_dry_run() || start.elapsed() + poke_interval >= timeout {
                        return Err(AdapterError::Timeout(start.elapsed()));
                    }
                    warn!(
                        task = %ctx.task.identifier,
                        attempt, failed, total,
                        "assertion not yet passing, poking again in {:?}",
                        poke_interval
                    );
                }
                Err(e) => return Err(e.into()),
            }
            thread::sleep(poke_interval);
            attempt += 1;
        }
    }
}
