use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Flags shared between the training loop and whoever may interrupt it.
///
/// The loop only checks these between epochs.
#[derive(Debug, Default)]
pub struct TrainingState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    epoch: AtomicUsize,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the loop as running. A stop requested earlier stays pending.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            log::info!("stop requested, training ends after the current epoch");
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stop_is_visible_across_threads() {
        let state = Arc::new(TrainingState::new());
        state.start();
        assert!(!state.should_stop());

        let remote = Arc::clone(&state);
        std::thread::spawn(move || remote.request_stop()).join().unwrap();
        assert!(state.should_stop());
        assert!(state.is_running());
    }

    #[test]
    fn stop_before_start_stays_pending() {
        let state = TrainingState::new();
        state.request_stop();
        state.start();
        assert!(state.should_stop());
    }
}
