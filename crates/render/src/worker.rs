//! Worker-side serve loop
//!
//! Runs inside an isolated render process: reads requests from `input`,
//! renders them and writes replies to `output` until the input closes.

use crate::raster::Renderer;
use crate::wire::{self, RenderReply, RenderRequest, WireError};
use log::{debug, warn};
use std::io::{BufReader, BufWriter, Read, Write};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Extra latency added before every render
    pub delay: Option<Duration>,
}

/// Counters reported when the input stream closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub rendered: u64,
    pub failed: u64,
}

/// Serve render requests until `input` reaches end of stream
///
/// Renderer faults are replied as failures and the loop continues; only I/O
/// and protocol errors end it early.
pub fn serve<R: Read, W: Write>(
    input: R,
    output: W,
    renderer: &dyn Renderer,
    options: &ServeOptions,
) -> Result<ServeSummary, WireError> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);
    let mut summary = ServeSummary::default();

    while let Some(request) = wire::read_request(&mut input)? {
        debug!(
            "worker: job {} for {} {} at scale {}",
            request.header.job_id, request.header.page_id, request.header.generation,
            request.header.scale
        );

        if let Some(delay) = options.delay {
            thread::sleep(delay);
        }

        let reply = render_one(&request, renderer);
        match &reply {
            RenderReply::Rendered { .. } => summary.rendered += 1,
            RenderReply::Failed { job_id, message } => {
                warn!("worker: job {job_id} failed: {message}");
                summary.failed += 1;
            }
        }
        wire::write_reply(&mut output, &reply)?;
    }

    debug!("worker: input closed after {} rendered, {} failed", summary.rendered, summary.failed);
    Ok(summary)
}

fn render_one(request: &RenderRequest, renderer: &dyn Renderer) -> RenderReply {
    let job_id = request.header.job_id;

    let snapshot = match request.snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return RenderReply::Failed { job_id, message: format!("invalid page snapshot: {err}") };
        }
    };
    if snapshot.page_id != request.header.page_id {
        return RenderReply::Failed {
            job_id,
            message: format!(
                "snapshot is for {} but the request names {}",
                snapshot.page_id, request.header.page_id
            ),
        };
    }

    match renderer.render(&snapshot, request.header.scale) {
        Ok(bitmap) => RenderReply::Rendered { job_id, bitmap },
        Err(fault) => RenderReply::Failed { job_id, message: fault.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{Generation, PageId, PageSnapshot};
    use crate::raster::RasterRenderer;
    use crate::wire::RequestHeader;
    use std::io::Cursor;

    fn encode(requests: &[RenderRequest]) -> Vec<u8> {
        let mut buf = Vec::new();
        for request in requests {
            wire::write_request(&mut buf, request).unwrap();
        }
        buf
    }

    fn small_page(id: u64) -> PageSnapshot {
        PageSnapshot { page_id: PageId(id), width: 20, height: 10, elements: Vec::new() }
    }

    #[test]
    fn test_serve_replies_in_order() {
        let input = encode(&[
            RenderRequest::new(1, &small_page(1), Generation(1), 1.0).unwrap(),
            RenderRequest::new(2, &small_page(2), Generation(1), 2.0).unwrap(),
        ]);
        let mut output = Vec::new();

        let summary =
            serve(input.as_slice(), &mut output, &RasterRenderer::new(), &ServeOptions::default())
                .unwrap();
        assert_eq!(summary, ServeSummary { rendered: 2, failed: 0 });

        let mut cursor = Cursor::new(output);
        let first = wire::read_reply(&mut cursor).unwrap().unwrap();
        let second = wire::read_reply(&mut cursor).unwrap().unwrap();
        assert!(matches!(first, RenderReply::Rendered { job_id: 1, ref bitmap } if bitmap.width == 20));
        assert!(matches!(second, RenderReply::Rendered { job_id: 2, ref bitmap } if bitmap.width == 40));
        assert!(wire::read_reply(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_renderer_fault_is_replied_not_fatal() {
        let input = encode(&[
            RenderRequest::new(1, &small_page(1), Generation(1), -1.0).unwrap(),
            RenderRequest::new(2, &small_page(1), Generation(1), 1.0).unwrap(),
        ]);
        let mut output = Vec::new();

        let summary =
            serve(input.as_slice(), &mut output, &RasterRenderer::new(), &ServeOptions::default())
                .unwrap();
        assert_eq!(summary, ServeSummary { rendered: 1, failed: 1 });

        let first = wire::read_reply(&mut Cursor::new(output)).unwrap().unwrap();
        assert!(matches!(first, RenderReply::Failed { job_id: 1, ref message } if message.contains("scale")));
    }

    #[test]
    fn test_bad_snapshot_payload_fails_job() {
        let request = RenderRequest {
            header: RequestHeader {
                job_id: 7,
                page_id: PageId(1),
                generation: Generation(1),
                scale: 1.0,
            },
            payload: b"{\"nope\": true}".to_vec(),
        };
        let mut output = Vec::new();
        serve(
            encode(&[request]).as_slice(),
            &mut output,
            &RasterRenderer::new(),
            &ServeOptions::default(),
        )
        .unwrap();

        let reply = wire::read_reply(&mut Cursor::new(output)).unwrap().unwrap();
        assert!(matches!(reply, RenderReply::Failed { job_id: 7, .. }));
    }

    #[test]
    fn test_truncated_input_ends_with_error() {
        let mut input = encode(&[RenderRequest::new(1, &small_page(1), Generation(1), 1.0).unwrap()]);
        input.truncate(input.len() - 2);

        let result =
            serve(input.as_slice(), Vec::new(), &RasterRenderer::new(), &ServeOptions::default());
        assert!(matches!(result, Err(WireError::Truncated)));
    }
}
