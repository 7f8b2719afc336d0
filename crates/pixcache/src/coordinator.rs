//! Decides when a retrieval's completion fires relative to pending cache writes.

use tracing::warn;

/// Progress of the cache writes of one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    ImageCached,
    OriginalImageCached,
    Done,
}

/// Cache write milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// All writes were started
    CacheInitiated,
    /// The processed image finished writing
    CachingImage,
    /// The original payload finished writing
    CachingOriginalImage,
}

/// Fires a trigger exactly once, after the writes the caller waits for.
pub struct CacheCallbackCoordinator {
    should_wait_for_cache: bool,
    should_cache_original: bool,
    state: CoordinatorState,
}

impl CacheCallbackCoordinator {
    pub fn new(should_wait_for_cache: bool, should_cache_original: bool) -> Self {
        Self {
            should_wait_for_cache,
            should_cache_original,
            state: CoordinatorState::Idle,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Feed a milestone; runs `trigger` when the completion should fire.
    pub fn apply(&mut self, action: CacheAction, trigger: impl FnOnce()) {
        use CacheAction::*;
        use CoordinatorState::*;

        match (self.state, action) {
            (Done, _) => {}

            (Idle, CacheInitiated) => {
                if !self.should_wait_for_cache {
                    self.state = Done;
                    trigger();
                }
            }
            (Idle, CachingImage) => {
                if self.should_cache_original {
                    self.state = ImageCached;
                } else {
                    self.state = Done;
                    trigger();
                }
            }
            (Idle, CachingOriginalImage) => {
                self.state = OriginalImageCached;
            }

            (ImageCached, CachingOriginalImage) | (OriginalImageCached, CachingImage) => {
                self.state = Done;
                trigger();
            }

            (state, action) => {
                warn!(?state, ?action, "Ignoring unexpected cache coordinator transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(coordinator: &mut CacheCallbackCoordinator, actions: &[CacheAction]) -> usize {
        let mut fired = 0;
        for action in actions {
            coordinator.apply(*action, || fired += 1);
        }
        fired
    }

    #[test]
    fn test_not_waiting_fires_on_initiated() {
        let mut c = CacheCallbackCoordinator::new(false, false);
        assert_eq!(
            run(&mut c, &[CacheAction::CachingImage, CacheAction::CacheInitiated]),
            1
        );

        let mut c = CacheCallbackCoordinator::new(false, true);
        assert_eq!(run(&mut c, &[CacheAction::CacheInitiated]), 1);
        assert_eq!(c.state(), CoordinatorState::Done);
        assert_eq!(run(&mut c, &[CacheAction::CachingImage]), 0);
    }

    #[test]
    fn test_waiting_fires_after_image_write() {
        let mut c = CacheCallbackCoordinator::new(true, false);
        assert_eq!(run(&mut c, &[CacheAction::CacheInitiated]), 0);
        assert_eq!(run(&mut c, &[CacheAction::CachingImage]), 1);
    }

    #[test]
    fn test_write_order_does_not_matter_with_original() {
        for order in [
            [CacheAction::CachingImage, CacheAction::CachingOriginalImage],
            [CacheAction::CachingOriginalImage, CacheAction::CachingImage],
        ] {
            let mut c = CacheCallbackCoordinator::new(true, true);
            assert_eq!(run(&mut c, &order), 1);
            assert_eq!(run(&mut c, &[CacheAction::CacheInitiated]), 0);
            assert_eq!(c.state(), CoordinatorState::Done);
        }
    }

    #[test]
    fn test_unexpected_transition_is_ignored() {
        let mut c = CacheCallbackCoordinator::new(true, true);
        run(&mut c, &[CacheAction::CachingImage]);
        assert_eq!(run(&mut c, &[CacheAction::CachingImage]), 0);
        assert_eq!(c.state(), CoordinatorState::ImageCached);
    }
}
