use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tagstream::{OrderedBarrier, OrderedPipeline};

#[test]
fn sync_serializes_ticket_order() {
    let barrier = OrderedBarrier::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    let mut tickets = Vec::new();
    for i in 0..4u64 {
        tickets.push((i, barrier.queue()));
    }
    // Start the workers in reverse so the barrier has to do the ordering.
    for (i, ticket) in tickets.into_iter().rev() {
        let order = order.clone();
        workers.push(thread::spawn(move || {
            // Simulate out-of-order completion of the parallel phase.
            thread::sleep(Duration::from_millis(5 * (4 - i)));
            ticket.sync();
            order.lock().unwrap().push(i);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    barrier.wait_until_finished();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn released_tickets_unblock_their_successors() {
    let barrier = OrderedBarrier::new();
    let first = barrier.queue();
    let second = barrier.queue();
    let third = barrier.queue();

    // Releasing out of order parks the instance until its turn.
    second.release();
    first.sync();
    third.sync();
    barrier.wait_until_finished();
}

#[test]
fn dropped_tickets_do_not_deadlock_the_barrier() {
    let barrier = OrderedBarrier::new();
    {
        let _dropped = barrier.queue();
    }
    let second = barrier.queue();
    second.sync();
    barrier.wait_until_finished();
}

#[test]
fn pipeline_stages_are_created_on_demand() {
    let pipeline = OrderedPipeline::new();
    let stage0 = pipeline.stage(0);
    let stage1 = pipeline.stage(1);
    let t0 = stage0.queue();
    let t1 = stage1.queue();
    t0.sync();
    t1.sync();
    pipeline.wait_until_finished();
}
