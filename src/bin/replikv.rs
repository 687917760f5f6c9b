/*
 * replikv is the replikv server. It takes the node's ID and the cluster
 * address list on the command line, replays the node's journal, and serves
 * both clients and Raft peers on the node's own address.
 */

#![warn(clippy::all)]

use replikv::errinput;
use replikv::error::Result;
use replikv::kv;
use replikv::Server;

fn main() -> Result<()> {
    let command = clap::command!()
        .about("A replicated key-value store server")
        .arg(
            clap::Arg::new("id")
                .required(true)
                .value_parser(clap::value_parser!(u8))
                .help("This node's 0-based index into the peer address list"),
        )
        .arg(
            clap::Arg::new("peers")
                .required(true)
                .num_args(1..)
                .help("host:port for every node in the cluster, in ID order"),
        )
        .arg(
            clap::Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log level (off, error, warn, info, debug, trace)"),
        )
        .arg(
            clap::Arg::new("data-dir")
                .long("data-dir")
                .default_value(".")
                .help("Directory to keep the AOFs journal directory in"),
        );
    let args = match command.try_get_matches() {
        Ok(args) => args,
        Err(err) => {
            // Argument errors exit with code 1, like bind errors.
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug && loglevel != simplelog::LevelFilter::Trace {
        logconfig.add_filter_allow_str("replikv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let id = *args.get_one::<u8>("id").unwrap();
    let peers: Vec<String> = args.get_many::<String>("peers").unwrap().cloned().collect();
    if id as usize >= peers.len() {
        return errinput!("node ID {id} is out of range for a cluster of {}", peers.len());
    }
    let addr = peers[id as usize].clone();

    let path = std::path::Path::new(args.get_one::<String>("data-dir").unwrap())
        .join("AOFs")
        .join(format!("kv_store_{id}.aof"));
    let store = kv::Store::open(&path)?;

    let listener = std::net::TcpListener::bind(&addr)?;
    Server::new(id, peers, Box::new(kv::KvState::new(store)))?.serve(listener)
}
