//! `fanconctl` — command-line client for `fancond` (spec §6).
//!
//! Parses the CLI surface described for reference in spec.md, connects
//! to the daemon's Unix domain socket, and issues the single RPC the
//! chosen subcommand needs. Grounded on `original_source/src/Client.cpp`'s
//! `Client::run` dispatch, translated from a gRPC stub into calls through
//! `fanconctl::client`.

use fanconctl::args::{Args, DEFAULT_SYSINFO_PATH};
use fanconctl::{client, commands};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help(config_path: &str) {
    println!("fanconctl {VERSION} - fancon control client");
    println!();
    println!("USAGE: fanconctl <flag> [value] ...");
    println!();
    println!("  -h  help           Show this help");
    println!("  -s  status         Status of all fans");
    println!("  -e  enable         Enable control of all fans");
    println!("  -e  enable  [fan]  Enable control of the fan");
    println!("  -d  disable        Disable control of all fans");
    println!("  -d  disable [fan]  Disable control of the fan");
    println!("  -t  test           Test all (untested) fans");
    println!("  -t  test    [fan]  Test the fan (forced)");
    println!("  -f  force          Test even already tested fans (default: false)");
    println!("  -r  reload         Reload config");
    println!("  -c  config  [file] Config path (default: {config_path})");
    println!("      service        Start as service (see: fancond)");
    println!("      daemon         Daemonize the process (see: fancond --daemon)");
    println!("      stop-service   Stop the service");
    println!("  -i  sysinfo [file] Save system info to file (default: {DEFAULT_SYSINFO_PATH})");
    println!("      nv-init        Init nvidia devices");
    println!("  -v  verbose        Debug logging level");
    println!("  -a  trace          Trace logging level");
}

fn init_logging(verbose: bool, trace: bool) {
    let level = if trace { "trace" } else if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .with_env_filter(std::env::var("FANCON_LOG").unwrap_or_else(|_| level.to_string()))
        .init();
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = Args::parse(&raw);

    init_logging(args.verbose.present, args.trace.present);

    if args.help.present {
        print_help(&args.config_path());
        std::process::exit(0);
    }

    if !args.unknown.is_empty() {
        eprintln!("unrecognised argument(s): {}", args.unknown.join(", "));
        print_help(&args.config_path());
        std::process::exit(2);
    }

    commands::warn_if_root_without_systemd();

    let socket_path = client::default_socket_path().to_string();

    if args.service.present || args.daemon.present {
        println!("fanconctl does not run the service itself; start `fancond` instead.");
        std::process::exit(2);
    }

    if client::connect(&socket_path).await.is_err() {
        eprintln!("fancond is not reachable at {socket_path}");
        std::process::exit(1);
    }

    let result = if args.status.present {
        commands::status(&socket_path).await
    } else if args.enable.present {
        commands::enable(&socket_path, args.enable.value.clone()).await
    } else if args.disable.present {
        commands::disable(&socket_path, args.disable.value.clone()).await
    } else if args.test.present {
        commands::test(&socket_path, args.test.value.clone(), args.force.present).await
    } else if args.reload.present {
        commands::reload(&socket_path).await
    } else if args.stop_service.present {
        commands::stop_service(&socket_path).await
    } else if args.nv_init.present {
        commands::nv_init(&socket_path).await
    } else if args.sysinfo.present {
        let path = args.sysinfo.value.clone().unwrap_or_else(|| DEFAULT_SYSINFO_PATH.to_string());
        commands::sysinfo(&socket_path, &path).await
    } else {
        print_help(&args.config_path());
        std::process::exit(0);
    };

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("fanconctl: {e}");
            std::process::exit(1);
        }
    }
}
