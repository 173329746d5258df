use std::io::Write;

use anyhow::Result;
use env_logger::{fmt, Builder, Env, Target};
use log::{debug, Level};

use crate::constants::ENV_LOG;
use crate::redirect::OutputStreamBinding;

/// Route `log` output to the driver's diagnostic stream.
///
/// Has to run after output redirection so that a discarded stderr doesn't swallow the
/// driver's own messages. A logger that is already installed is left in place.
pub fn init(binding: &OutputStreamBinding) -> Result<()> {
    let sink = binding.writer()?;
    let env = Env::default().filter_or(ENV_LOG, "info");

    let res = Builder::from_env(env)
        .target(Target::Pipe(Box::new(sink)))
        .format(|buf, record| {
            let mut style = buf.style();
            match record.level() {
                Level::Error => {
                    style.set_color(fmt::Color::Red).set_bold(true);
                }
                Level::Warn => {
                    style.set_color(fmt::Color::Yellow).set_bold(true);
                }
                _ => {}
            };

            writeln!(buf, "[afl-driver] {}", style.value(record.args()))
        })
        .try_init();
    if res.is_err() {
        debug!("logger already installed");
    }

    Ok(())
}
