use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::debug;

use swmr::{read_published, Clock, Monotonic};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let DumpCommand {
        md_file,
        watch,
        interval,
    } = DumpCommand::parse();

    let clock = Monotonic;
    let mut last_tick = None;

    loop {
        match read_published(&md_file) {
            Ok((header, entries)) => {
                if last_tick != Some(header.tick) {
                    last_tick = Some(header.tick);

                    println!(
                        "tick {:>6}  page_size {}  index at {}+{}  entries {}",
                        header.tick,
                        header.page_size,
                        header.index_offset,
                        header.index_length,
                        entries.len(),
                    );
                    for entry in &entries {
                        println!(
                            "  page {:>8} -> md page {:>4}  {:>8} bytes  crc {:08x}",
                            entry.page, entry.md_page, entry.length, entry.chksum,
                        );
                    }
                } else {
                    debug!(tick = header.tick, "unchanged");
                }
            }
            Err(err) => {
                eprintln!("cannot read {}: {}", md_file.display(), err);
                return ExitCode::FAILURE;
            }
        }

        if !watch {
            return ExitCode::SUCCESS;
        }
        clock.sleep(Duration::from_millis(u64::from(interval) * 100));
    }
}

#[derive(Parser)]
struct DumpCommand {
    /// Keep polling and print every new publication.
    ///
    /// Polling uses the consistent-read protocol of a reader, so a dump that
    /// races the writer's in-place rewrite is retried rather than shown torn.
    #[arg(long)]
    watch: bool,

    /// Poll interval in tenths of a second.
    #[arg(long, default_value_t = 10)]
    interval: u32,

    #[arg(help = "The metadata file to decode")]
    md_file: PathBuf,
}
