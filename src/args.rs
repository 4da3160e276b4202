use std::path::PathBuf;

use clap::{arg, command, value_parser};

use crate::errors::HprofRetainError;

#[derive(Debug, Clone)]
pub struct Args {
    pub dump: PathBuf,
    pub index_dir: Option<PathBuf>,
    pub memory_mb: usize,
    pub top: usize,
    pub rebuild: bool,
    pub show_unreachable: bool,
    pub show_parse_summary: bool,
}

pub fn get_args() -> Result<Args, HprofRetainError> {
    let matches = command!()
        .arg(
            arg!(<dump> "binary hprof heap dump (or an already built index directory)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-i --index <DIR> "index directory (defaults to a '.hpridx' sibling of the dump)")
                .required(false)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-m --memory <MIB> "working-set memory budget in MiB")
                .required(false)
                .value_parser(value_parser!(usize))
                .default_value("1024"),
        )
        .arg(
            arg!(-t --top <ROWS> "rows per report table")
                .required(false)
                .value_parser(value_parser!(usize))
                .default_value("20"),
        )
        .arg(arg!(-r --rebuild "rebuild the index even if a fresh one exists"))
        .arg(arg!(-u --unreachable "report unreachable garbage"))
        .arg(arg!(-s --summary "also print the raw file content summary"))
        .get_matches();

    Ok(Args {
        dump: matches
            .get_one::<PathBuf>("dump")
            .expect("dump path is required")
            .clone(),
        index_dir: matches.get_one::<PathBuf>("index").cloned(),
        memory_mb: *matches.get_one::<usize>("memory").expect("defaulted"),
        top: *matches.get_one::<usize>("top").expect("defaulted"),
        rebuild: matches.get_flag("rebuild"),
        show_unreachable: matches.get_flag("unreachable"),
        show_parse_summary: matches.get_flag("summary"),
    })
}
