//! Bounded producer/consumer request queue (C4): Tellers push, the server
//! pops in FIFO order, and each slot carries its own response semaphore so
//! a reply is delivered to exactly the Teller that submitted it.
//!
//! A bounded channel with blocking producers and a single logical consumer
//! loop, the same shape as an in-process `std::sync::mpsc::sync_channel`
//! translated to a ring buffer living in shared memory, because here the
//! producers are separate OS processes rather than threads.

use thiserror::Error;

use crate::shm::{self, ShmHandle};

pub const REQ_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Deposit = 0,
    Withdraw = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpStatus {
    Ok = 0,
    Insufficient = 1,
    Error = 2,
}

/// One fixed-position record in the shared ring buffer. `bank_id == -1`
/// means NEW on input; the server overwrites it with the assigned id when
/// it replies, so a single field carries both directions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestSlot {
    pub client_pid: i32,
    pub bank_id: i32,
    pub kind: RequestKind,
    pub amount: i64,
    pub result_balance: i64,
    pub op_status: OpStatus,
}

pub const NEW: i32 = -1;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Shm(#[from] shm::Error),
}

/// Teller side: acquire a free-slot ticket, claim a position under the
/// queue mutex, write the request, and signal it filled. Returns the index
/// the caller must later wait on for the response.
pub fn push(handle: &ShmHandle, mut entry: RequestSlot) -> Result<usize, Error> {
    let region = handle.region();
    region.free_slots.wait()?;
    region.queue_mutex.wait()?;
    let region_mut = handle.region_mut();
    let idx = region_mut.tail as usize;
    entry.op_status = OpStatus::Error; // overwritten by the server before it replies
    region_mut.slots[idx] = entry;
    region_mut.tail = (region_mut.tail + 1) % REQ_QUEUE_LEN as u32;
    region.queue_mutex.post()?;
    region.filled_slots.post()?;
    Ok(idx)
}

/// Server side: wait for an available item, claim the head position under
/// the queue mutex, and hand back both its index (to address the response
/// semaphore) and its contents.
pub fn pop(handle: &ShmHandle) -> Result<(usize, RequestSlot), Error> {
    let region = handle.region();
    region.filled_slots.wait()?;
    region.queue_mutex.wait()?;
    let region_mut = handle.region_mut();
    let idx = region_mut.head as usize;
    let entry = region_mut.slots[idx];
    region_mut.head = (region_mut.head + 1) % REQ_QUEUE_LEN as u32;
    region.queue_mutex.post()?;
    region.free_slots.post()?;
    Ok((idx, entry))
}

/// Non-blocking drain: pops everything currently available without
/// suspending, so the server's main loop can service the queue alongside
/// the server FIFO in one pass. Returns `Ok(None)` once `filled_slots`
/// would otherwise block.
pub fn try_pop(handle: &ShmHandle) -> Result<Option<(usize, RequestSlot)>, Error> {
    let region = handle.region();
    if !region.filled_slots.timed_wait(std::time::Duration::from_millis(0))? {
        return Ok(None);
    }
    region.queue_mutex.wait()?;
    let region_mut = handle.region_mut();
    let idx = region_mut.head as usize;
    let entry = region_mut.slots[idx];
    region_mut.head = (region_mut.head + 1) % REQ_QUEUE_LEN as u32;
    region.queue_mutex.post()?;
    region.free_slots.post()?;
    Ok(Some((idx, entry)))
}

/// Write the server's result fields into slot `idx`. Must be called only
/// after the corresponding log append has been flushed, and while still
/// holding the database mutex, so the write happens before the mutex is
/// released.
pub fn write_result(
    handle: &ShmHandle,
    idx: usize,
    bank_id: i32,
    result_balance: i64,
    op_status: OpStatus,
) {
    let region_mut = handle.region_mut();
    region_mut.slots[idx].bank_id = bank_id;
    region_mut.slots[idx].result_balance = result_balance;
    region_mut.slots[idx].op_status = op_status;
}

/// Wakes the Teller waiting on slot `idx`. Called once the database mutex
/// has been released, so the response is the last step of the sequence.
pub fn post_response(handle: &ShmHandle, idx: usize) -> Result<(), Error> {
    handle.region().response_ready[idx].post()?;
    Ok(())
}

/// Convenience combining `write_result` and `post_response` for callers
/// that have no surrounding lock to release between the two steps (tests,
/// benches).
pub fn respond(
    handle: &ShmHandle,
    idx: usize,
    bank_id: i32,
    result_balance: i64,
    op_status: OpStatus,
) -> Result<(), Error> {
    write_result(handle, idx, bank_id, result_balance, op_status);
    post_response(handle, idx)
}

/// Teller side: block until the server has posted a response for `idx`,
/// then read it back out.
pub fn await_response(handle: &ShmHandle, idx: usize) -> Result<RequestSlot, Error> {
    handle.region().response_ready[idx].wait()?;
    Ok(handle.region().slots[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(amount: i64) -> RequestSlot {
        RequestSlot {
            client_pid: 1,
            bank_id: NEW,
            kind: RequestKind::Deposit,
            amount,
            result_balance: 0,
            op_status: OpStatus::Error,
        }
    }

    #[test]
    fn push_then_pop_preserves_fifo_order() {
        let name = format!("/adabank-queue-test-{}", std::process::id());
        let (mut h, _) = ShmHandle::create_or_attach(&name).unwrap();
        h.mark_owner();

        push(&h, entry(10)).unwrap();
        push(&h, entry(20)).unwrap();
        push(&h, entry(30)).unwrap();

        let (_, a) = pop(&h).unwrap();
        let (_, b) = pop(&h).unwrap();
        let (_, c) = pop(&h).unwrap();
        assert_eq!((a.amount, b.amount, c.amount), (10, 20, 30));

        h.destroy().unwrap();
    }

    #[test]
    fn try_pop_returns_none_when_empty() {
        let name = format!("/adabank-queue-test2-{}", std::process::id());
        let (mut h, _) = ShmHandle::create_or_attach(&name).unwrap();
        h.mark_owner();
        assert!(try_pop(&h).unwrap().is_none());
        h.destroy().unwrap();
    }

    #[test]
    fn respond_then_await_response_round_trips() {
        let name = format!("/adabank-queue-test3-{}", std::process::id());
        let (mut h, _) = ShmHandle::create_or_attach(&name).unwrap();
        h.mark_owner();

        let idx = push(&h, entry(100)).unwrap();
        let (popped_idx, _) = pop(&h).unwrap();
        assert_eq!(popped_idx, idx);
        respond(&h, idx, 7, 900, OpStatus::Ok).unwrap();
        let reply = await_response(&h, idx).unwrap();
        assert_eq!(reply.bank_id, 7);
        assert_eq!(reply.result_balance, 900);
        assert_eq!(reply.op_status, OpStatus::Ok);

        h.destroy().unwrap();
    }
}
