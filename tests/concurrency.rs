//! End-to-end exercise of the queue + engine path across real OS threads
//! acting as Tellers, with a single consumer thread standing in for the
//! server main loop. Checks the N-Tellers/M-deposits invariant: the final
//! balance and log record count are exact regardless of interleaving.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use adabank::account::AccountTable;
use adabank::engine;
use adabank::log::TransactionLog;
use adabank::queue::{self, OpStatus, RequestKind, RequestSlot, NEW};
use adabank::shm::ShmHandle;

const TELLERS: usize = 20;
const DEPOSITS_PER_TELLER: usize = 50;

#[test]
fn n_tellers_m_deposits_sum_exactly() {
    let name = format!("/adabank-it-concurrency-{}", std::process::id());
    let (mut shm, _) = ShmHandle::create_or_attach(&name).unwrap();
    shm.mark_owner();
    let shm = Arc::new(shm);

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("bank.log");
    let mut log = TransactionLog::open(&log_path).unwrap();
    engine::apply_deposit(&mut shm.region_mut().accounts, &mut log, NEW, 0).unwrap();

    let total_ops = TELLERS * DEPOSITS_PER_TELLER;
    let applied = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..TELLERS)
        .map(|t| {
            let shm = Arc::clone(&shm);
            std::thread::spawn(move || {
                for _ in 0..DEPOSITS_PER_TELLER {
                    let idx = queue::push(
                        &shm,
                        RequestSlot {
                            client_pid: t as i32,
                            bank_id: 0,
                            kind: RequestKind::Deposit,
                            amount: 1,
                            result_balance: 0,
                            op_status: OpStatus::Error,
                        },
                    )
                    .unwrap();
                    let reply = queue::await_response(&shm, idx).unwrap();
                    assert_eq!(reply.op_status, OpStatus::Ok);
                }
            })
        })
        .collect();

    let consumer = {
        let shm = Arc::clone(&shm);
        let applied = Arc::clone(&applied);
        std::thread::spawn(move || {
            while applied.load(Ordering::SeqCst) < total_ops {
                if let Some((idx, request)) = queue::try_pop(&shm).unwrap() {
                    let outcome = engine::apply_deposit(
                        &mut shm.region_mut().accounts,
                        &mut log,
                        request.bank_id,
                        request.amount,
                    )
                    .unwrap();
                    queue::respond(&shm, idx, outcome.bank_id, outcome.balance, outcome.status).unwrap();
                    applied.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };

    for p in producers {
        p.join().unwrap();
    }
    consumer.join().unwrap();

    assert_eq!(shm.region().accounts.balance(0).unwrap(), total_ops as i64);

    let mut replayed: Box<AccountTable> = unsafe {
        let layout = std::alloc::Layout::new::<AccountTable>();
        let ptr = std::alloc::alloc(layout) as *mut AccountTable;
        Box::from_raw(ptr)
    };
    TransactionLog::replay(&log_path, &mut replayed).unwrap();
    assert_eq!(replayed.balance(0).unwrap(), total_ops as i64);

    let log_text = std::fs::read_to_string(&log_path).unwrap();
    let deposit_lines = log_text.lines().filter(|l| l.starts_with("DEPOSIT 0 ")).count();
    // one DEPOSIT from the initial NEW allocation, plus one per applied op
    assert_eq!(deposit_lines, total_ops + 1);

    Arc::try_unwrap(shm).ok().unwrap().destroy().unwrap();
}
