use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flux_reactor::EventLoop;

/// Schedules a few one-shot timers plus a repeater, cancels the repeater
/// partway through, and checks both the firing order of the one-shots and
/// that the repeater stopped firing once canceled.
#[test]
fn timers_fire_in_order_and_repeating_cancels_cleanly() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let repeats = Arc::new(Mutex::new(0u32));

    let order_first = order.clone();
    let order_second = order.clone();
    let repeats_cb = repeats.clone();

    let join = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("event loop");
        let handle = event_loop.handle();

        handle.run_after(Duration::from_millis(15), move || order_first.lock().unwrap().push("first"));

        let quit_handle = handle.clone();
        handle.run_after(Duration::from_millis(60), move || {
            order_second.lock().unwrap().push("second");
            quit_handle.quit();
        });

        let repeat_id = handle.run_every(Duration::from_millis(8), move || {
            *repeats_cb.lock().unwrap() += 1;
        });

        let cancel_handle = handle.clone();
        handle.run_after(Duration::from_millis(35), move || cancel_handle.cancel(repeat_id));

        event_loop.run();
    });

    join.join().expect("event loop thread panicked");

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    let fired = *repeats.lock().unwrap();
    assert!((2..=6).contains(&fired), "expected a handful of repeats before cancel, got {fired}");
}

/// A timer canceled before it ever fires must not run at all, even though
/// the loop keeps running past its original due time.
#[test]
fn canceling_a_pending_timer_before_it_fires_suppresses_it() {
    let fired = Arc::new(Mutex::new(false));
    let fired_cb = fired.clone();

    let join = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("event loop");
        let handle = event_loop.handle();

        let id = handle.run_after(Duration::from_millis(20), move || {
            *fired_cb.lock().unwrap() = true;
        });
        handle.cancel(id);

        let quit_handle = handle.clone();
        handle.run_after(Duration::from_millis(50), move || quit_handle.quit());

        event_loop.run();
    });

    join.join().expect("event loop thread panicked");
    assert!(!*fired.lock().unwrap(), "canceled timer fired anyway");
}
