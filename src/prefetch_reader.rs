use std::fs::File;
use std::io::{BufReader, Read};
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

/// Reads the dump ahead of the parser on its own thread, recycling buffers
/// through a pool channel so steady-state parsing allocates nothing.
pub struct PrefetchReader {
    reader: BufReader<File>,
    file_len: usize,
    start_offset: usize,
    buffer_size: usize,
}

impl PrefetchReader {
    pub fn new(
        reader: BufReader<File>,
        file_len: usize,
        start_offset: usize,
        buffer_size: usize,
    ) -> Self {
        PrefetchReader {
            reader,
            file_len,
            start_offset,
            buffer_size,
        }
    }

    pub fn start(
        mut self,
        send_data: Sender<Vec<u8>>,
        receive_pooled_data: Receiver<Vec<u8>>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("hprof-prefetcher".to_string())
            .spawn(move || {
                let mut remaining = self.file_len - self.start_offset;
                while remaining > 0 {
                    // A closed pool means the parser is gone; stop reading.
                    let Ok(mut buffer) = receive_pooled_data.recv() else {
                        break;
                    };
                    let chunk_size = self.buffer_size.min(remaining);
                    buffer.resize(chunk_size, 0);
                    if let Err(e) = self.reader.read_exact(&mut buffer) {
                        log::error!("read failed while prefetching dump: {e}");
                        break;
                    }
                    remaining -= chunk_size;
                    if send_data.send(buffer).is_err() {
                        break;
                    }
                }
            })
    }
}
