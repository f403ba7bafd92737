//! Per-connection retransmission service: one thread per accepted stream,
//! servicing `RETX_REQ`/`BOP_REQ`/`EOP_REQ`/`RETX_END` from a single
//! receiver.

use super::retention::RetentionMap;
use crate::error::TransportError;
use crate::notify::SenderNotifier;
use crate::registry::CancelToken;
use crate::transport::StreamConnection;
use crate::wire::{self, Flags, Header};
use std::sync::Arc;

pub struct ServiceContext {
    pub retention: Arc<RetentionMap>,
    pub notifier: Option<Arc<dyn SenderNotifier>>,
    pub connected: Arc<parking_lot::Mutex<std::collections::HashSet<u64>>>,
}

/// Runs the retransmission service loop for one accepted connection until
/// the peer disconnects, a parse error terminates the task, or `cancel` is
/// set. On exit, releases `stream_id` from every retention entry it was
/// still pending in and notifies `on_eop` for any that became empty as a
/// result — this is how the sender's "drop and release" error policy for
/// transient transport errors is realized.
pub fn run_service(
    mut conn: StreamConnection,
    stream_id: u64,
    ctx: Arc<ServiceContext>,
    cancel: CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match conn.recv_header() {
            Ok(header) => {
                if let Err(e) = handle_one(&mut conn, stream_id, &header, &ctx) {
                    log::warn!("retx service for stream {stream_id} terminating: {e}");
                    break;
                }
            }
            Err(TransportError::PeerClosed) => {
                log::info!("receiver on stream {stream_id} disconnected");
                break;
            }
            Err(e) => {
                log::warn!("retx service for stream {stream_id} terminating: {e}");
                break;
            }
        }
    }
    ctx.connected.lock().remove(&stream_id);
    for prodindex in ctx.retention.release_from_all(stream_id) {
        if let Some(notifier) = &ctx.notifier {
            notifier.on_eop(prodindex);
        }
    }
}

fn handle_one(
    conn: &mut StreamConnection,
    stream_id: u64,
    header: &Header,
    ctx: &ServiceContext,
) -> Result<(), TransportError> {
    match header.flags {
        Flags::RetxReq => handle_retx_req(conn, header, ctx),
        Flags::BopReq => handle_bop_req(conn, header, ctx),
        Flags::EopReq => handle_eop_req(conn, header, ctx),
        Flags::RetxEnd => {
            if ctx.retention.release_receiver(header.prodindex, stream_id) {
                if let Some(notifier) = &ctx.notifier {
                    notifier.on_eop(header.prodindex);
                }
            }
            Ok(())
        }
        // Unknown/irrelevant flags on this stream are ignored, not fatal.
        _ => Ok(()),
    }
}

fn reject(conn: &mut StreamConnection, prodindex: u32) -> Result<(), TransportError> {
    conn.send_framed(&Header::new(prodindex, 0, 0, Flags::RetxRej), &[])
}

fn handle_retx_req(
    conn: &mut StreamConnection,
    header: &Header,
    ctx: &ServiceContext,
) -> Result<(), TransportError> {
    let Some(entry) = ctx.retention.get(header.prodindex) else {
        return reject(conn, header.prodindex);
    };
    for (start, size) in wire::retransmit_chunks(header.seqnum, header.payloadlen, entry.prodlen) {
        let payload = &entry.payload[start as usize..(start as usize + size as usize)];
        conn.send_framed(&Header::new(header.prodindex, start, size, Flags::RetxData), payload)?;
    }
    Ok(())
}

fn handle_bop_req(
    conn: &mut StreamConnection,
    header: &Header,
    ctx: &ServiceContext,
) -> Result<(), TransportError> {
    let Some(entry) = ctx.retention.get(header.prodindex) else {
        return reject(conn, header.prodindex);
    };
    let payload = wire::encode_bop_payload(entry.prodlen, &entry.metadata);
    conn.send_framed(
        &Header::new(header.prodindex, 0, payload.len() as u16, Flags::RetxBop),
        &payload,
    )
}

fn handle_eop_req(
    conn: &mut StreamConnection,
    header: &Header,
    ctx: &ServiceContext,
) -> Result<(), TransportError> {
    if ctx.retention.get(header.prodindex).is_none() {
        return reject(conn, header.prodindex);
    }
    conn.send_framed(&Header::new(header.prodindex, 0, 0, Flags::RetxEop), &[])
}
