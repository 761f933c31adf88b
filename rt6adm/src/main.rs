// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rt6::device::{Device, DeviceFlags};
use rt6::{RouteFlags, RoutingTable, Rt6Route};
use rt6_common::log::{init_logger, init_term_logger};
use slog::{debug, Logger};
use std::io::{stdout, Write};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use tabwriter::TabWriter;

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, infer_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON table description with tunables, devices and routes
    #[arg(short, long, env = "RT6ADM_CONFIG")]
    config: Option<PathBuf>,

    /// Log bunyan records to stdout instead of the terminal format
    #[arg(long, env = "RT6ADM_BUNYAN")]
    bunyan: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the routes in the table.
    Show {
        /// Include destination-cache entries.
        #[arg(long)]
        cache: bool,
    },

    /// Print the fixed-width route dump.
    Dump {
        #[arg(short, long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long, default_value_t = 4096)]
        length: usize,
    },

    /// Print the table counters.
    Stats,

    /// Resolve a destination the way the forwarding path would.
    Lookup {
        addr: Ipv6Addr,

        /// Prefer routes out of this device.
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Apply a file of binary route messages, then show the table.
    Apply { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = if cli.bunyan {
        init_logger()
    } else {
        init_term_logger()
    };

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let table = config.build(log.clone())?;

    match cli.command {
        Commands::Show { cache } => show(&table, cache)?,
        Commands::Dump { offset, length } => {
            print!("{}", table.rt6_get_info(offset, length));
        }
        Commands::Stats => print!("{}", table.rt6_get_stats()),
        Commands::Lookup { addr, device } => {
            lookup(&table, &config, addr, device)?
        }
        Commands::Apply { file } => apply(&table, &log, file)?,
    }
    Ok(())
}

fn flag_string(flags: RouteFlags) -> String {
    [
        (RouteFlags::UP, 'U'),
        (RouteFlags::GATEWAY, 'G'),
        (RouteFlags::HOST, 'H'),
        (RouteFlags::DYNAMIC, 'D'),
        (RouteFlags::MODIFIED, 'M'),
        (RouteFlags::REJECT, '!'),
        (RouteFlags::ADDRCONF, 'A'),
        (RouteFlags::ALLONLINK, 'L'),
        (RouteFlags::DCACHE, 'C'),
    ]
    .iter()
    .filter(|(f, _)| flags.contains(*f))
    .map(|(_, c)| *c)
    .collect()
}

fn opt_addr(addr: Option<Ipv6Addr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".into())
}

fn show(table: &RoutingTable, cache: bool) -> Result<()> {
    let routes: Vec<Rt6Route> = table
        .routes()
        .into_iter()
        .filter(|r| cache || !r.is_cache())
        .collect();

    let mut tw = TabWriter::new(stdout());
    writeln!(
        &mut tw,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        "Destination".dimmed(),
        "Gateway".dimmed(),
        "Nexthop".dimmed(),
        "Device".dimmed(),
        "Metric".dimmed(),
        "Use".dimmed(),
        "Ref".dimmed(),
        "Flags".dimmed(),
    )?;
    for r in &routes {
        writeln!(
            &mut tw,
            "{}/{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.dst,
            r.prefixlen,
            opt_addr(r.gateway),
            opt_addr(r.nexthop),
            r.device,
            r.metric,
            r.usecnt,
            r.refcnt,
            flag_string(r.flags()),
        )?;
    }
    tw.flush()?;
    Ok(())
}

fn lookup(
    table: &RoutingTable,
    config: &Config,
    addr: Ipv6Addr,
    device: Option<String>,
) -> Result<()> {
    let dev = match device {
        Some(name) => {
            let d = config
                .devices
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| anyhow!("no device {name}"))?;
            let mut flags = DeviceFlags::UP;
            if d.loopback {
                flags |= DeviceFlags::LOOPBACK;
            }
            Some(Device::new(&d.name, d.mtu, flags))
        }
        None => None,
    };

    let dst = table.dst_route(&addr, dev.as_ref(), RouteFlags::empty())?;
    let info = table.route_info(dst.route);
    table.dst_unlock(dst);

    let Some(r) = info else {
        return Err(anyhow!("resolution of {addr} vanished"));
    };
    if r.flags().contains(RouteFlags::REJECT) {
        println!("{addr}: {}", "unreachable".red());
        return Ok(());
    }
    let kind = if dst.route.is_cached() {
        "cached".green()
    } else {
        "shared".yellow()
    };
    println!("{addr}: {r} ({kind}, serial {})", dst.sernum);
    println!("  nexthop {}", opt_addr(r.nexthop));
    if let Some(pmtu) = r.pmtu {
        println!("  pmtu {pmtu}");
    }
    Ok(())
}

fn apply(table: &RoutingTable, log: &Logger, file: PathBuf) -> Result<()> {
    let buf = std::fs::read(&file)
        .with_context(|| format!("read {}", file.display()))?;
    let consumed = table.msgrcv(&buf)?;
    debug!(log, "applied route messages"; "bytes" => consumed);
    show(table, false)
}
