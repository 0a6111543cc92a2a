//! `/init` of the Rookery boot archive.
//!
//! Runs as PID 1: finds the live medium, builds the overlay root and execs
//! the real init. If anything fatal happens it prints why and keeps a shell
//! running; PID 1 must never exit.

use std::time::Duration;

use rookiso::boot::{BootResolver, LinuxOps};
use rookiso::process::Cmd;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("rookery: init panicked: {}", panic_info);
        rescue_shell();
    }));

    // Console logging at info until the command line asks for debug
    let (filter, handle) = reload::Layer::new(EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).without_time())
        .try_init()
    {
        eprintln!("rookery: failed to initialize logging: {}", e);
    }

    tracing::info!("Rookery boot resolver starting");

    let mut resolver = BootResolver::new(LinuxOps::new());
    let result = resolver.run(|cmdline| {
        if cmdline.debug {
            if let Err(e) = handle.modify(|f| *f = EnvFilter::new("debug")) {
                eprintln!("rookery: cannot raise log level: {}", e);
            }
        }
    });

    // Only reached when the handoff did not happen
    let failure = match result {
        Ok(never) => match never {},
        Err(failure) => failure,
    };
    tracing::error!("{}", failure);
    eprint!("{}", failure.diagnostic());
    tracing::debug!("stages: {:?}", resolver.trace());
    rescue_shell();
}

fn rescue_shell() -> ! {
    loop {
        match Cmd::new("/bin/sh").allow_fail().run_interactive() {
            Ok(status) => eprintln!("rookery: shell exited ({}), restarting", status),
            Err(e) => eprintln!("rookery: cannot start /bin/sh: {:#}", e),
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}
