//! Windowed file transfer.
//!
//! Downloads are pull-controlled: the server keeps at most `window` data
//! chunks unacknowledged and sends another one for every acknowledgement.
//! Uploads are push-controlled: the server advertises its window in the
//! open response and acknowledges every request with exactly one response.

use std::fs::File;
use std::io::{BufWriter, Read, Write};

use tether_proto::{GetFileReq, GetFileRsp, PutFileReq, PutFileRsp, ServerToClient};
use tracing::debug;

use super::{Context, describe};

/// Download cursor.
#[derive(Debug, Default)]
pub struct GetStream {
    /// File being sent, `None` when idle.
    pub file: Option<File>,
    /// Chunks sent and not yet acknowledged.
    pub outstanding: u32,
    /// Negotiated window.
    pub window: u32,
}

/// Upload cursor.
#[derive(Debug, Default)]
pub struct PutStream {
    /// File being written, `None` when idle.
    pub file: Option<BufWriter<File>>,
}

/// Handles a [`GetFileReq`]: opens a download or acknowledges chunks.
pub fn get(stream: &mut GetStream, req: &GetFileReq, cx: &mut Context<'_>) {
    if req.path.is_empty() {
        if stream.file.is_none() {
            return;
        }
        if req.acknowledge_count > stream.outstanding {
            debug!(
                client = %cx.client,
                acknowledged = req.acknowledge_count,
                outstanding = stream.outstanding,
                "download over-acknowledged, aborting"
            );
            stream.file = None;
            return;
        }
        stream.outstanding -= req.acknowledge_count;
    } else if !open(stream, req, cx) {
        return;
    }
    refill(stream, cx);
}

/// Opens a download and sends the first chunk. Returns whether the stream
/// is still open.
fn open(stream: &mut GetStream, req: &GetFileReq, cx: &mut Context<'_>) -> bool {
    stream.file = None;
    stream.outstanding = 0;

    let opened = File::open(&req.path).and_then(|file| {
        let size = file.metadata()?.len();
        Ok((file, size))
    });
    let (file, size) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            debug!(client = %cx.client, path = %req.path, error = %e, "download open failed");
            cx.outbox.push(ServerToClient::GetFileRsp(GetFileRsp {
                error: describe(&e),
                ..GetFileRsp::default()
            }));
            return false;
        }
    };

    debug!(client = %cx.client, path = %req.path, size, "download");
    stream.window = match req.window_size {
        0 => cx.config.get_file_window,
        requested => requested.min(cx.config.get_file_window_max),
    };
    stream.file = Some(file);

    let (data, error) = next_chunk(stream, cx.config.get_file_chunk_size);
    let more = !data.is_empty();
    cx.outbox
        .push(ServerToClient::GetFileRsp(GetFileRsp { size, data, error }));
    if more {
        stream.outstanding = 1;
    }
    more
}

/// Sends chunks until the window is full or the file ends.
fn refill(stream: &mut GetStream, cx: &mut Context<'_>) {
    while stream.file.is_some() && stream.outstanding < stream.window {
        let (data, error) = next_chunk(stream, cx.config.get_file_chunk_size);
        let done = data.is_empty();
        cx.outbox.push(ServerToClient::GetFileRsp(GetFileRsp {
            size: 0,
            data,
            error,
        }));
        if done {
            break;
        }
        stream.outstanding += 1;
    }
}

/// Reads the next chunk. An empty chunk closes the stream, carrying an
/// error string if the read failed.
fn next_chunk(stream: &mut GetStream, chunk_size: usize) -> (Vec<u8>, String) {
    let Some(file) = stream.file.as_mut() else {
        return (Vec::new(), String::new());
    };
    let mut data = Vec::with_capacity(chunk_size);
    match Read::by_ref(file).take(chunk_size as u64).read_to_end(&mut data) {
        Ok(0) => {
            stream.file = None;
            (data, String::new())
        }
        Ok(_) => (data, String::new()),
        Err(e) => {
            debug!(error = %e, "download read failed");
            stream.file = None;
            (Vec::new(), "Read error.".to_owned())
        }
    }
}

/// Handles a [`PutFileReq`]: opens, appends to, or closes an upload.
pub fn put(stream: &mut PutStream, req: &PutFileReq, cx: &mut Context<'_>) {
    let mut rsp = PutFileRsp {
        acknowledge_count: 1,
        ..PutFileRsp::default()
    };

    if !req.path.is_empty() {
        stream.file = None;
        rsp.window_size = cx.config.put_file_window;
        match File::create(&req.path) {
            Ok(file) => {
                debug!(client = %cx.client, path = %req.path, size = req.size, "upload");
                stream.file = Some(BufWriter::new(file));
            }
            Err(e) => {
                debug!(client = %cx.client, path = %req.path, error = %e, "upload open failed");
                rsp.error = "Open failed.".to_owned();
            }
        }
    } else if !req.data.is_empty() {
        match stream.file.as_mut() {
            Some(file) => {
                if let Err(e) = file.write_all(&req.data) {
                    debug!(client = %cx.client, error = %e, "upload write failed");
                    rsp.error = "Write failed.".to_owned();
                    stream.file = None;
                }
            }
            None => rsp.error = "No file open.".to_owned(),
        }
    } else if let Some(mut file) = stream.file.take() {
        if let Err(e) = file.flush() {
            debug!(client = %cx.client, error = %e, "upload flush failed");
            rsp.error = describe(&e);
        }
    }

    cx.outbox.push(ServerToClient::PutFileRsp(rsp));
}
