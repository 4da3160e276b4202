pub mod args;
pub mod config;
pub mod errors;
pub mod graph;
pub mod index;
pub mod parser;
pub mod prefetch_reader;
pub mod report;
pub mod snapshot;
pub mod utils;

pub use crate::config::{AnalysisOptions, CancelToken};
pub use crate::errors::HprofRetainError;
pub use crate::index::builder::{build_index, BuildStats};
pub use crate::index::format::{ClassDefinition, GcRootEntry, ObjectKind, RootKind};
pub use crate::index::ObjectId;
pub use crate::snapshot::{ClassRetained, Dominator, Snapshot};

use std::thread;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::args::get_args;
use crate::utils::pretty_bytes_size;

pub fn run() -> Result<(), HprofRetainError> {
    let args = get_args()?;
    let started = Instant::now();
    let options = AnalysisOptions::default()
        .with_memory_budget(args.memory_mb * 1024 * 1024)
        .with_rebuild(args.rebuild);

    let (snapshot, build_stats) = if args.dump.is_dir() {
        Snapshot::open_with_progress(&args.dump, &options, None)?
    } else {
        let file_len = std::fs::metadata(&args.dump)?.len();
        println!(
            "Processing {} binary hprof file '{}'.",
            pretty_bytes_size(file_len),
            args.dump.display()
        );

        // an index build streams the dump twice
        let (send_progress, receive_progress) = crossbeam_channel::unbounded::<u64>();
        let pb = ProgressBar::new(file_len * 2);
        pb.set_style(ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} (speed:{bytes_per_sec}) (eta:{eta})")
            .expect("templating should never fail")
            .progress_chars("#>-"));
        let pb_thread = thread::spawn(move || {
            while let Ok(position) = receive_progress.recv() {
                pb.set_position(position);
            }
            pb.finish_and_clear();
        });

        let opened = match &args.index_dir {
            Some(dir) => Snapshot::open_dump_at(&args.dump, dir, &options, Some(send_progress)),
            None => Snapshot::open_with_progress(&args.dump, &options, Some(send_progress)),
        };
        pb_thread
            .join()
            .map_err(|e| HprofRetainError::StdThreadError { e })?;
        opened?
    };

    if args.show_parse_summary {
        if let Some(stats) = &build_stats {
            println!("{}", report::render_parse_summary(&stats.tallies));
        }
    }
    println!("{}", report::render_summary(&snapshot));
    println!("{}", report::render_top_classes(&snapshot, args.top)?);
    println!("{}", report::render_top_objects(&snapshot, args.top)?);
    if args.show_unreachable {
        println!("{}", report::render_unreachable(&snapshot));
    }
    println!("Analysis completed in {:?}.", started.elapsed());
    snapshot.close();
    Ok(())
}
