use nfsotp::{otp::OtpClient, portmap, ClientConfig};

use argh::FromArgs;
use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Print a one-time password for an NFS server, derived from a nonce
/// the server issues and a secret read from the terminal
struct Command {
    /// server as host[:port]
    #[argh(positional)]
    server: String,

    /// ask the portmapper for the MOUNT port when none is given
    #[argh(switch)]
    portmap: bool,

    /// seconds to wait for a reply, default is 10
    #[argh(option, default = "10")]
    timeout: u64,

    /// log protocol details to stderr
    #[argh(switch, short = 'v')]
    verbose: bool,
}

/// Splits `host[:port]`, IPv6 addresses go in brackets
fn split_host_port(server: &str) -> Result<(String, Option<u16>), String> {
    let (host, port) = match server.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, port)) => match port.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(format!("invalid server {:?}", server)),
            },
            None => return Err(format!("invalid server {:?}", server)),
        },
        None => match server.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (server, None),
        },
    };

    if host.is_empty() {
        return Err(format!("invalid server {:?}", server));
    }
    let port = port
        .map(|port| port.parse::<u16>().map_err(|_| format!("invalid port {:?}", port)))
        .transpose()?;

    Ok((host.to_string(), port))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(cmd: Command) -> Result<String, Box<dyn Error>> {
    let (host, port) = split_host_port(&cmd.server)?;
    let config = ClientConfig::default().with_timeout(Duration::from_secs(cmd.timeout));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let port = match port {
        Some(port) => port,
        None if cmd.portmap => runtime.block_on(portmap::get_port(
            &host,
            config.mount.program,
            config.mount.version,
            &config,
        ))?,
        None => return Err("no port given (use host:port, or --portmap)".into()),
    };

    let client = runtime.block_on(OtpClient::connect(&host, port, config))?;
    let password = rpassword::prompt_password("Password: ")?;

    runtime.block_on(async {
        let res = client.get_otp(password.as_bytes()).await;
        let _ = client.close().await;
        Ok::<_, Box<dyn Error>>(res?)
    })
}

fn main() -> ExitCode {
    let cmd: Command = argh::from_env();
    init_logging(cmd.verbose);

    match run(cmd) {
        Ok(otp) => {
            println!("{}", otp);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
