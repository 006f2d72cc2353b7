//! podnet: CNI plugin binary, exec'd by the container runtime.

use clap::{Parser, ValueEnum};
use podnet_cni::result::{CNI_VERSION, is_supported_version};
use podnet_cni::{
    CmdArgs, ErrorReply, IpRouteWiring, NetConf, Plugin, PluginError, VersionReply, logging,
    open_ipam, open_tables,
};
use serde::Serialize;
use std::io::{self, Read};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum CniCommand {
    Add,
    Check,
    Del,
    Version,
}

#[derive(Parser, Debug)]
#[command(name = "podnet", version, about = "Pod network CNI plugin")]
struct Cli {
    #[arg(long, env = "CNI_COMMAND", value_enum, ignore_case = true)]
    command: CniCommand,

    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    #[arg(long, env = "CNI_NETNS", default_value = "")]
    netns: String,

    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    ifname: String,

    #[arg(long, env = "CNI_ARGS", default_value = "")]
    args: String,

    #[arg(long, env = "CNI_PATH", default_value = "")]
    path: String,
}

impl Cli {
    fn cmd_args(&self) -> CmdArgs {
        CmdArgs {
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            ifname: self.ifname.clone(),
            args: self.args.clone(),
            path: self.path.clone(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!(error = %e, "Failed to encode reply"),
    }
}

fn fail(cni_version: &str, err: &PluginError) -> ExitCode {
    error!(code = err.code(), error = %err, "Command failed");
    print_json(&ErrorReply::new(cni_version, err));
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            logging::init_stderr();
            return fail(CNI_VERSION, &PluginError::Args(e.to_string()));
        }
    };

    if cli.command == CniCommand::Version {
        print_json(&VersionReply::default());
        return ExitCode::SUCCESS;
    }

    let mut stdin = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut stdin) {
        logging::init_stderr();
        return fail(CNI_VERSION, &PluginError::Internal(format!("reading stdin: {}", e)));
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            logging::init_stderr();
            return fail(CNI_VERSION, &PluginError::Internal(format!("runtime: {}", e)));
        }
    };

    let args = cli.cmd_args();
    let conf = match NetConf::parse(&stdin) {
        Ok(conf) => conf,
        Err(e) => {
            logging::init_stderr();
            if cli.command == CniCommand::Del {
                // Still remove what can be found from the arguments alone
                warn!(error = %e, "Unusable configuration on DEL, removing veth only");
                runtime.block_on(podnet_cni::delete(None, None, &IpRouteWiring::new(), &args));
                return ExitCode::SUCCESS;
            }
            return fail(CNI_VERSION, &e);
        }
    };

    logging::init(&conf.log_file(), conf.log_level.as_deref());
    info!(
        command = ?cli.command,
        container_id = %args.container_id,
        netns = %args.netns,
        ifname = %args.ifname,
        network = %conf.name,
        "podnet invoked"
    );

    let version = conf.cni_version.clone();
    match cli.command {
        CniCommand::Del => {
            runtime.block_on(run_del(conf, &args));
            ExitCode::SUCCESS
        }
        command => match runtime.block_on(run(command, conf, &args)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(&version, &e),
        },
    }
}

async fn run(command: CniCommand, conf: NetConf, args: &CmdArgs) -> podnet_cni::Result<()> {
    if !is_supported_version(&conf.cni_version) {
        return Err(PluginError::IncompatibleVersion(conf.cni_version));
    }

    let tables = open_tables(&conf)?;
    let ipam = open_ipam(&conf).await?;
    let mut plugin = Plugin::new(conf, ipam, tables, IpRouteWiring::new());

    match command {
        CniCommand::Add => {
            let result = plugin.add(args).await?;
            print_json(&result);
        }
        CniCommand::Check => plugin.check(args).await?,
        CniCommand::Del | CniCommand::Version => {}
    }
    Ok(())
}

/// DEL with whatever could be opened. Never fails.
async fn run_del(conf: NetConf, args: &CmdArgs) {
    let wiring = IpRouteWiring::new();

    let mut tables = open_tables(&conf)
        .inspect_err(|e| warn!(error = %e, "Forwarding tables unavailable on DEL"))
        .ok();
    let ipam = open_ipam(&conf)
        .await
        .inspect_err(|e| warn!(error = %e, "Address store unavailable on DEL"))
        .ok();

    let report = podnet_cni::delete(ipam.as_ref(), tables.as_mut(), &wiring, args).await;
    if !report.is_clean() {
        warn!(failures = ?report.failures, "DEL finished with leftovers");
    }
}
