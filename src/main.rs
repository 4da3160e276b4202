use std::process::exit;

fn main() {
    if let Err(e) = hprof_retain::run() {
        eprintln!("{e}");
        exit(1);
    }
}
