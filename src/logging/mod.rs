//! Logger bootstrap shared by hosts and tests.

use std::io::Write;
use std::sync::Once;

use env_logger::Builder;

static INIT: Once = Once::new();

/// Initialize `env_logger` once for the process. The default level is
/// `info`; `RUST_LOG` overrides it as usual. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {} {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init();
        super::init();
        log::debug!("logger initialized twice without panicking");
    }
}
