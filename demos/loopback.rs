//! Copies a file between two engines which run in the same process and are connected through
//! an in-memory link. The link can lose a range of File Data PDUs on their first transmission
//! to show the class 2 retransmission procedures.
use std::{
    collections::VecDeque,
    fs,
    path::PathBuf,
    sync::mpsc,
};

use cfdp_engine::{
    config::EngineConfig,
    engine::Engine,
    event::{Event, EventHook},
    filestore::NativeFilestore,
    pdu::TransmissionMode,
    request::TxFileRequest,
    PduOwnedWithInfo,
};
use clap::Parser;
use log::{info, warn};

const SENDER_ID: u64 = 25;
const RECEIVER_ID: u64 = 23;

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum ClassCli {
    /// Class 1, unacknowledged.
    One,
    /// Class 2, acknowledged.
    Two,
}

#[derive(clap::Parser)]
#[command(about = "Copy a file between two local CFDP engines")]
pub struct Cli {
    /// File to send. A random file is generated when omitted.
    #[arg(short, long)]
    file: Option<PathBuf>,
    #[arg(short, long, value_enum, default_value = "two")]
    class: ClassCli,
    /// Start of the byte range which is lost on its first transmission.
    #[arg(long)]
    drop_start: Option<u64>,
    /// End of the byte range which is lost on its first transmission.
    #[arg(long)]
    drop_end: Option<u64>,
    #[arg(long, default_value_t = 100)]
    max_cycles: usize,
    #[arg(long, default_value_t = 512)]
    chunk_size: usize,
}

/// Prints every event with the name of the engine which raised it.
pub struct PrintingHook {
    name: &'static str,
}

impl EventHook for PrintingHook {
    fn on_event(&mut self, event: &Event) {
        println!("[{}] {}", self.name, event);
    }
}

type DemoEngine = Engine<mpsc::Sender<PduOwnedWithInfo>, NativeFilestore, PrintingHook>;

fn build_engine(
    local_eid: u64,
    tmp_dir: &str,
    chunk_size: usize,
    name: &'static str,
) -> (DemoEngine, mpsc::Receiver<PduOwnedWithInfo>) {
    let mut cfg = EngineConfig::new_with_default_values(local_eid, tmp_dir);
    cfg.ticks_per_second = 1;
    let channel = &mut cfg.channels[0];
    channel.ack_timer_s = 2;
    channel.nak_timer_s = 2;
    channel.outgoing_file_chunk_size = chunk_size;
    let (tx, rx) = mpsc::channel();
    let engine = Engine::new(cfg, tx, NativeFilestore::default(), PrintingHook { name })
        .expect("invalid engine configuration");
    (engine, rx)
}

fn offset_of(pdu: &PduOwnedWithInfo) -> Option<u64> {
    match cfdp_engine::codec::decode_pdu(&pdu.pdu) {
        Some(decoded) => match decoded.body {
            cfdp_engine::pdu::PduBody::FileData(fd) => Some(fd.offset),
            _ => None,
        },
        None => {
            warn!("link carried a malformed PDU");
            None
        }
    }
}

fn main() {
    let cli_args = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(LOG_LEVEL)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let workdir = tempfile::tempdir().expect("creating temp directory failed");
    let sender_tmp = workdir.path().join("sender-tmp");
    let receiver_tmp = workdir.path().join("receiver-tmp");
    fs::create_dir(&sender_tmp).unwrap();
    fs::create_dir(&receiver_tmp).unwrap();

    let src = match &cli_args.file {
        Some(path) => path.clone(),
        None => {
            let path = workdir.path().join("random.bin");
            let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
            fs::write(&path, data).unwrap();
            info!("created random source file {:?}", path);
            path
        }
    };
    let dst = workdir.path().join("received.bin");

    let (mut sender, sender_out) = build_engine(
        SENDER_ID,
        sender_tmp.to_str().unwrap(),
        cli_args.chunk_size,
        "sender",
    );
    let (mut receiver, receiver_out) = build_engine(
        RECEIVER_ID,
        receiver_tmp.to_str().unwrap(),
        cli_args.chunk_size,
        "receiver",
    );

    let class = match cli_args.class {
        ClassCli::One => TransmissionMode::Unacknowledged,
        ClassCli::Two => TransmissionMode::Acknowledged,
    };
    let src_str = src.to_str().unwrap();
    let dst_str = dst.to_str().unwrap();
    let request = TxFileRequest::new(class, true, 0, 0, RECEIVER_ID, src_str, dst_str)
        .expect("file path too long");
    let id = sender.tx_file(&request).expect("file transfer was rejected");
    info!("started transaction {}", id);

    let drop_range = match (cli_args.drop_start, cli_args.drop_end) {
        (Some(start), Some(end)) if start < end => Some(start..end),
        (None, None) => None,
        _ => {
            warn!("ignoring incomplete or empty drop range");
            None
        }
    };
    let mut dropped = Vec::new();
    let mut to_sender = VecDeque::new();
    let mut to_receiver = VecDeque::new();

    for cycle in 1..=cli_args.max_cycles {
        sender.cycle(&mut to_sender);
        while let Ok(pdu) = sender_out.try_recv() {
            if let (Some(range), Some(offset)) = (&drop_range, offset_of(&pdu)) {
                if range.contains(&offset) && !dropped.contains(&offset) {
                    info!("link lost File Data PDU at offset {}", offset);
                    dropped.push(offset);
                    continue;
                }
            }
            to_receiver.push_back(pdu);
        }
        receiver.cycle(&mut to_receiver);
        while let Ok(pdu) = receiver_out.try_recv() {
            to_sender.push_back(pdu);
        }
        let sender_done = sender.history(0).next().is_some();
        let receiver_done = receiver.history(0).next().is_some();
        if sender_done && receiver_done {
            info!("transfer finished after {} cycles", cycle);
            break;
        }
    }

    for (name, engine) in [("sender", &sender), ("receiver", &receiver)] {
        match engine.history(0).next() {
            Some(entry) => info!(
                "{}: transaction {} finished with {:?}, {} bytes",
                name, entry.id, entry.status, entry.file_size
            ),
            None => warn!("{}: transaction did not finish", name),
        }
    }
    match (fs::read(&src), fs::read(&dst)) {
        (Ok(sent), Ok(received)) if sent == received => info!("file contents match"),
        (Ok(_), Ok(_)) => warn!("file contents differ"),
        _ => warn!("could not compare the source and destination files"),
    }
}
