//! Operator tool for poking at the NAND block layer from the command line.
//!
//! Useful interactively against the simulator while developing, and against
//! real chips (via the GPIO bus) when bringing up hardware.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use std::fs;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_gadget::bus::gpio::{GpioBus, GpioPins};
use nand_gadget::{
    bus::{NandBus, SimBus},
    chip::NandConfig,
    cmd::NandCommander,
    codec::PageCodec,
    ftl::BlockManager,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct BusOptions {
    /// Directory holding the simulated chip image files
    #[clap(long, group = "bus-options")]
    sim_dir: Option<PathBuf>,

    /// GPIO character device wired to a real NAND bus (reference pin map)
    #[cfg(target_os = "linux")]
    #[clap(long, group = "bus-options")]
    gpio_chip: Option<String>,

    /// Chip geometry, as CSxBLOCKSxPAGESxDATAxSPARE
    #[clap(long, default_value = "2x1024x64x2048x128")]
    geometry: NandConfig,

    /// Where the block-state snapshot lives
    #[clap(long, default_value = "nand-blockstate.bin")]
    state_file: PathBuf,
}

enum BusKind {
    Sim(SimBus),

    #[cfg(target_os = "linux")]
    Gpio(GpioBus),
}

impl BusOptions {
    fn open(&self) -> Result<BusKind> {
        if let Some(dir) = &self.sim_dir {
            return Ok(BusKind::Sim(SimBus::open(dir, self.geometry)?));
        }

        #[cfg(target_os = "linux")]
        if let Some(chip) = &self.gpio_chip {
            return Ok(BusKind::Gpio(GpioBus::open(GpioPins::reference(chip))?));
        }

        unreachable!("clap requires one bus option")
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read and print the ID bytes of every configured chip select
    Probe,

    /// Throw away the snapshot and rebuild block state from the chips
    Scan,

    /// Print per-chip block totals
    Stats,

    /// Allocate one block
    Alloc {
        /// Only consider this chip select
        #[clap(long)]
        cs: Option<usize>,
    },

    /// Return an allocated block to the pool
    Release { cs: usize, block: u32 },

    /// Erase an allocated block
    Erase { cs: usize, block: u32 },

    /// Program one page of an allocated block (encoded: scrambled, CRC in
    /// the spare area)
    Program {
        cs: usize,
        block: u32,
        page: u32,

        /// File holding the data-area bytes; a fill pattern when omitted
        #[clap(long)]
        input: Option<PathBuf>,

        /// Fill byte used when no input file is given
        #[clap(long, default_value_t = 0xA5)]
        fill: u8,
    },

    /// Read one page of an allocated block
    Read {
        cs: usize,
        block: u32,
        page: u32,

        /// Dump the raw page (data + spare) without decoding
        #[clap(long)]
        raw: bool,

        /// Write the bytes here instead of summarizing to stdout
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Allocate a block, erase it, program every page, and read it all back
    Exercise,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    bus: BusOptions,

    #[clap(subcommand)]
    cmd: Command,
}

fn run<B: NandBus>(bus: B, args: &Cli) -> Result<()> {
    let config = args.bus.geometry;
    let mut cmd = NandCommander::new(bus, config);

    if let Command::Probe = args.cmd {
        for cs in 0..config.num_cs {
            let id = cmd.read_id(cs)?;
            let verdict = if id == config.id_expect { "ok" } else { "unexpected" };
            println!("cs {cs}: {id:02x?} ({verdict})");
        }
        return Ok(());
    }

    if let Command::Scan = args.cmd {
        match fs::remove_file(&args.bus.state_file) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }

    let mut mgr = BlockManager::open(cmd, &args.bus.state_file)?;
    let codec = PageCodec::new(config);

    match &args.cmd {
        Command::Probe => unreachable!("handled above"),

        Command::Scan | Command::Stats => {
            for cs in 0..mgr.num_cs() {
                let counts = mgr.counts(cs)?;
                println!(
                    "cs {cs}: {} free, {} allocated, {} bad",
                    counts.free, counts.allocated, counts.bad
                );
            }
        }

        Command::Alloc { cs } => {
            let (cs, block) = mgr.alloc(*cs)?;
            println!("allocated cs {cs} block {block}");
        }

        Command::Release { cs, block } => {
            mgr.release(*cs, *block)?;
            println!("released cs {cs} block {block}");
        }

        Command::Erase { cs, block } => {
            if mgr.erase(*cs, *block)? {
                println!("erased cs {cs} block {block}");
            } else {
                println!("erase failed; block marked bad -- allocate a replacement");
            }
        }

        Command::Program {
            cs,
            block,
            page,
            input,
            fill,
        } => {
            let data = match input {
                Some(path) => fs::read(path)?,
                None => vec![*fill; config.page_data_bytes],
            };
            let encoded = codec.encode(&data)?;
            if mgr.program(*cs, *block, *page, &encoded)? {
                println!("programmed cs {cs} block {block} page {page}");
            } else {
                println!("program failed; block marked bad -- allocate a replacement");
            }
        }

        Command::Read {
            cs,
            block,
            page,
            raw,
            output,
        } => {
            let Some(content) = mgr.read(*cs, *block, *page)? else {
                println!("absent: block not allocated or address out of range");
                return Ok(());
            };

            let bytes = if *raw {
                content
            } else {
                match codec.decode(&content)? {
                    Some(data) => data,
                    None => {
                        println!("page is blank or failed its integrity check");
                        return Ok(());
                    }
                }
            };

            match output {
                Some(path) => fs::write(path, &bytes)?,
                None => {
                    let preview = bytes.iter().take(32).map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ");
                    println!("{} bytes: {preview}{}", bytes.len(), if bytes.len() > 32 { " ..." } else { "" });
                }
            }
        }

        Command::Exercise => exercise(&mut mgr, &codec)?,
    }

    Ok(())
}

/// Write and verify a whole block, allocating replacements if blocks go bad
/// along the way.
fn exercise<B: NandBus>(mgr: &mut BlockManager<B>, codec: &PageCodec) -> Result<()> {
    let config = *mgr.config();
    let pattern = |page: u32| -> Vec<u8> {
        (0..config.page_data_bytes)
            .map(|i| (i as u32).wrapping_mul(page + 1) as u8)
            .collect()
    };

    'find_block: loop {
        let (cs, block) = mgr.alloc(None)?;
        println!("exercising cs {cs} block {block}");

        if !mgr.erase(cs, block)? {
            println!("block went bad on erase, trying the next one");
            continue;
        }

        for page in 0..config.pages_per_block {
            if !mgr.program(cs, block, page, &codec.encode(&pattern(page))?)? {
                println!("block went bad on program, trying the next one");
                continue 'find_block;
            }
        }

        for page in 0..config.pages_per_block {
            let content = mgr.read(cs, block, page)?.expect("block is allocated");
            anyhow::ensure!(
                codec.decode(&content)? == Some(pattern(page)),
                "page {page} read back wrong"
            );
        }

        println!("wrote and verified {} pages", config.pages_per_block);
        mgr.release(cs, block)?;
        return Ok(());
    }
}

fn main() -> Result<()> {
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let args = Cli::parse();
    match args.bus.open()? {
        BusKind::Sim(bus) => run(bus, &args),

        #[cfg(target_os = "linux")]
        BusKind::Gpio(bus) => run(bus, &args),
    }
}
