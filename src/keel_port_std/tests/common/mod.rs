use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Run a scenario with a hard wall-clock deadline. A wedged scheduler
/// would otherwise hang the whole harness, which is strictly worse than a
/// failure.
pub fn with_deadline(test: impl FnOnce()) {
    let _ = env_logger::builder().is_test(true).try_init();

    let done = Arc::new(AtomicBool::new(false));
    let watchdog = Arc::clone(&done);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(120));
        if !watchdog.load(Ordering::SeqCst) {
            eprintln!("scenario exceeded its deadline; aborting");
            std::process::exit(101);
        }
    });

    test();
    done.store(true, Ordering::SeqCst);
}
