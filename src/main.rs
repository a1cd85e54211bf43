use wardend::daemonize::{daemonize, DaemonizeOutcome};
use wardend::options::{Cli, ParseOutcome};
use wardend::supervisor::Supervisor;
use wardend::{logging, signals};

fn main() {
    let options = match Cli::parse_outcome(std::env::args_os()) {
        ParseOutcome::Continue(options) => *options,
        ParseOutcome::ExitSuccess(text) => {
            println!("{text}");
            std::process::exit(0);
        }
        ParseOutcome::ExitFailure(err) => {
            eprintln!("wardend: {err}");
            std::process::exit(1);
        }
    };

    logging::init("wardend");

    let pid_fd = match daemonize(options.pid_file.as_deref()) {
        Ok(DaemonizeOutcome::Parent) => std::process::exit(0),
        Ok(DaemonizeOutcome::Child { pid_fd }) => pid_fd,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };

    logging::enable_syslog();

    if let Err(err) = signals::install() {
        log::error!("failed to install signal handlers: {err}");
        std::process::exit(1);
    }

    let exit_code = Supervisor::new(options, pid_fd).run();

    std::process::exit(exit_code);
}
