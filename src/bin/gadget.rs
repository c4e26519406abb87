//! USB gadget front-end: serves the block layer to a host over a pair of
//! bulk endpoints.
//!
//! Poor man's block-device protocol: each request is a fixed header --
//! opcode, chip select, block, page, payload length -- followed by that many
//! payload bytes (programs only). Every request is answered with a one-byte
//! status, followed by any response payload:
//!
//! | Op | Meaning | Payload in         | Payload out          |
//! | -- | ------- | ------------------ | -------------------- |
//! | 0  | Info    | -                  | geometry + totals    |
//! | 1  | Alloc   | -                  | cs, block            |
//! | 2  | Release | -                  | -                    |
//! | 3  | Erase   | -                  | -                    |
//! | 4  | Program | data-area bytes    | -                    |
//! | 5  | Read    | -                  | data-area bytes      |
//! | 255| Bye     | -                  | -                    |
//!
//! Mapping host logical blocks onto (cs, block, page) triples -- and
//! allocating a replacement when a program answers "block retired" -- is
//! host policy; this end only executes. Page payloads are encoded/decoded
//! here (scramble + spare-area CRC), so the host deals in plain data.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use bytes::{Buf, BufMut, BytesMut};
use clap::Parser;
use thiserror::Error;
use usb_gadget::{
    default_udc,
    function::custom::{
        Custom, Endpoint, EndpointDirection, EndpointReceiver, EndpointSender, Interface,
    },
    Class, Config, Gadget, Id, RegGadget, Strings,
};

use nand_gadget::bus::gpio::{GpioBus, GpioPins};
use nand_gadget::{
    bus::{NandBus, SimBus},
    chip::NandConfig,
    cmd::NandCommander,
    codec::PageCodec,
    error::Error,
    ftl::BlockManager,
};

const OP_INFO: u8 = 0;
const OP_ALLOC: u8 = 1;
const OP_RELEASE: u8 = 2;
const OP_ERASE: u8 = 3;
const OP_PROGRAM: u8 = 4;
const OP_READ: u8 = 5;
const OP_BYE: u8 = 255;

/// Wildcard chip select for Alloc: pick any.
const CS_ANY: u8 = 0xFF;

/// op + cs + block + page + len
const FRAME_LEN: usize = 1 + 1 + 4 + 4 + 4;

#[derive(Error, Debug)]
enum ServeError {
    #[error("command frame too short")]
    ShortCommand,

    #[error("payload ended before the announced length")]
    ShortPayload,

    #[error("unknown opcode {0}")]
    UnknownOp(u8),

    #[error("page not readable (unallocated, out of range, or blank)")]
    Absent,

    #[error("the chip reported the operation failed; block retired")]
    BlockRetired,

    #[error(transparent)]
    Block(#[from] Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServeError {
    fn status_code(&self) -> u8 {
        match self {
            ServeError::ShortCommand | ServeError::ShortPayload => 1,
            ServeError::UnknownOp(_) => 2,
            ServeError::Absent => 3,
            ServeError::BlockRetired => 4,
            ServeError::Block(Error::AllocationExhausted) => 5,
            ServeError::Block(Error::InvalidState { .. }) => 6,
            ServeError::Block(_) => 7,
            ServeError::Io(_) => 8,
        }
    }
}

/// Register a custom gadget function with one bulk endpoint per direction.
/// The returned handles must stay alive for as long as the gadget serves.
fn setup_gadget() -> anyhow::Result<(EndpointSender, EndpointReceiver, Custom, RegGadget)> {
    usb_gadget::remove_all().context("cannot remove existing gadgets")?;
    let serial_number = std::fs::read("/proc/device-tree/serial-number")
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .unwrap_or_default();

    let (ep_cmd_rx, ep_cmd_dir) = EndpointDirection::host_to_device();
    let (ep_resp_tx, ep_resp_dir) = EndpointDirection::device_to_host();

    let (custom, handle) = Custom::builder()
        .with_interface(
            Interface::new(Class::vendor_specific(1, 2), "block interface")
                .with_endpoint(Endpoint::bulk(ep_cmd_dir))
                .with_endpoint(Endpoint::bulk(ep_resp_dir)),
        )
        .build();
    let udc = default_udc().context("cannot get UDC")?;
    let reg = Gadget::new(
        Class::new(255, 255, 3),
        Id::new(0x1d6b, 0x0104),
        Strings::new("nand-gadget", "NAND block storage", serial_number),
    )
    .with_config(Config::new("config").with_function(handle))
    .bind(&udc)
    .context("cannot bind to UDC")?;

    log::info!("gadget bound to UDC, waiting for a host");

    Ok((ep_resp_tx, ep_cmd_rx, custom, reg))
}

fn read_payload(rx: &mut EndpointReceiver, len: usize) -> Result<Vec<u8>, ServeError> {
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let chunk = rx.recv_and_fetch(BytesMut::with_capacity(len - data.len()))?;
        if chunk.is_empty() {
            return Err(ServeError::ShortPayload);
        }
        data.extend_from_slice(&chunk);
    }
    data.truncate(len);
    Ok(data)
}

fn send_response(tx: &mut EndpointSender, code: u8, body: &[u8]) -> io::Result<()> {
    let mut bytes = BytesMut::with_capacity(1 + body.len());
    bytes.put_u8(code);
    bytes.put_slice(body);
    tx.send(bytes.freeze())?;
    Ok(())
}

fn handle<B: NandBus>(
    mgr: &mut BlockManager<B>,
    codec: &PageCodec,
    op: u8,
    cs: u8,
    block: u32,
    page: u32,
    payload: Vec<u8>,
) -> Result<BytesMut, ServeError> {
    let mut body = BytesMut::new();
    match op {
        OP_INFO => {
            let config = *mgr.config();
            body.put_u8(mgr.num_cs() as u8);
            body.put_u32(config.blocks_per_cs);
            body.put_u32(config.pages_per_block);
            body.put_u32(config.page_data_bytes as u32);
            body.put_u32(config.page_spare_bytes as u32);
            for cs in 0..mgr.num_cs() {
                let counts = mgr.counts(cs)?;
                body.put_u32(counts.free);
                body.put_u32(counts.allocated);
                body.put_u32(counts.bad);
            }
        }

        OP_ALLOC => {
            let want = (cs != CS_ANY).then_some(usize::from(cs));
            let (cs, block) = mgr.alloc(want)?;
            body.put_u8(cs as u8);
            body.put_u32(block);
        }

        OP_RELEASE => mgr.release(cs.into(), block)?,

        OP_ERASE => {
            if !mgr.erase(cs.into(), block)? {
                return Err(ServeError::BlockRetired);
            }
        }

        OP_PROGRAM => {
            let encoded = codec.encode(&payload)?;
            if !mgr.program(cs.into(), block, page, &encoded)? {
                return Err(ServeError::BlockRetired);
            }
        }

        OP_READ => {
            let content = mgr.read(cs.into(), block, page)?.ok_or(ServeError::Absent)?;
            let data = codec.decode(&content)?.ok_or(ServeError::Absent)?;
            body.put_slice(&data);
        }

        other => return Err(ServeError::UnknownOp(other)),
    }
    Ok(body)
}

fn serve<B: NandBus>(
    mut mgr: BlockManager<B>,
    tx: &mut EndpointSender,
    rx: &mut EndpointReceiver,
) -> Result<(), ServeError> {
    let codec = PageCodec::new(*mgr.config());

    loop {
        let mut frame = rx.recv_and_fetch(BytesMut::with_capacity(FRAME_LEN))?;
        if frame.remaining() < FRAME_LEN {
            // A half frame means the host side is confused; better to tear
            // down than to guess at re-synchronization.
            return Err(ServeError::ShortCommand);
        }
        let op = frame.get_u8();
        let cs = frame.get_u8();
        let block = frame.get_u32();
        let page = frame.get_u32();
        let len = frame.get_u32() as usize;
        if frame.has_remaining() {
            log::warn!("dropping {} trailing bytes", frame.remaining());
        }

        if op == OP_BYE {
            log::info!("host signalled end of session");
            return Ok(send_response(tx, 0, &[])?);
        }

        let payload = if len > 0 {
            read_payload(rx, len)?
        } else {
            Vec::new()
        };

        match handle(&mut mgr, &codec, op, cs, block, page, payload) {
            Ok(body) => send_response(tx, 0, &body)?,
            Err(e) => {
                log::warn!("request op={op} failed: {e}");
                send_response(tx, e.status_code(), &[])?;
            }
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Serve from simulated chip images in this directory instead of real
    /// hardware
    #[clap(long)]
    sim_dir: Option<PathBuf>,

    /// GPIO character device wired to the NAND bus (reference pin map)
    #[clap(long, conflicts_with = "sim_dir")]
    gpio_chip: Option<String>,

    /// Chip geometry, as CSxBLOCKSxPAGESxDATAxSPARE
    #[clap(long, default_value = "2x1024x64x2048x128")]
    geometry: NandConfig,

    /// Where the block-state snapshot lives
    #[clap(long, default_value = "nand-blockstate.bin")]
    state_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());
    let args = Cli::parse();

    let (mut tx, mut rx, _custom, _reg) = setup_gadget()?;

    let result = if let Some(dir) = &args.sim_dir {
        let bus = SimBus::open(dir, args.geometry)?;
        let mgr = BlockManager::open(NandCommander::new(bus, args.geometry), &args.state_file)?;
        serve(mgr, &mut tx, &mut rx)
    } else {
        let chip = args.gpio_chip.as_deref().unwrap_or("/dev/gpiochip0");
        let bus = GpioBus::open(GpioPins::reference(chip))?;
        let mgr = BlockManager::open(NandCommander::new(bus, args.geometry), &args.state_file)?;
        serve(mgr, &mut tx, &mut rx)
    };

    Ok(result.context("serving block requests")?)
}
