//! Cooperative interruption for blocking waits.
//!
//! Threads cannot be interrupted from the outside, so every wait that should
//! respond to cancellation polls an [`InterruptToken`]. Each thread has a
//! *current* token; worker pools install a per-task token (a child of the
//! pool's token) for the duration of every task, so shutting a pool down
//! interrupts the waits of everything it is running.
//!
//! Waits that must not be short-circuited (plain `lock()`) simply never look
//! at the token.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Interrupted;

/// Default slice used by interruptible waits between token checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct TokenState {
    flag: AtomicBool,
    parent: Option<Arc<TokenState>>,
}

impl TokenState {
    fn is_set(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        let mut next = self.parent.as_deref();
        while let Some(state) = next {
            if state.flag.load(Ordering::Acquire) {
                return true;
            }
            next = state.parent.as_deref();
        }
        false
    }
}

/// Shareable interruption flag.
///
/// Clones observe the same flag. A [`child`](Self::child) token reports
/// interruption when it, or any of its ancestors, has been interrupted;
/// interrupting a child never affects the parent.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    state: Arc<TokenState>,
}

impl InterruptToken {
    /// Create a fresh, uninterrupted root token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is also interrupted whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(TokenState {
                flag: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.state)),
            }),
        }
    }

    /// Request interruption.
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::Release);
    }

    /// True once this token or an ancestor was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.state.is_set()
    }

    /// Fail with [`Interrupted`] if the token has fired.
    pub fn check(&self, what: &str) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted::new(what))
        } else {
            Ok(())
        }
    }

    /// Make this token the calling thread's current token until the guard drops.
    pub fn install(&self) -> InterruptScope {
        let previous = CURRENT.with(|slot| slot.replace(Some(self.clone())));
        InterruptScope { previous }
    }

    /// True if both handles observe the same flag.
    pub fn same_as(&self, other: &InterruptToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<InterruptToken>> = const { RefCell::new(None) };
}

/// Guard restoring the previously installed token on drop.
#[derive(Debug)]
#[must_use = "the token is uninstalled when the scope is dropped"]
pub struct InterruptScope {
    previous: Option<InterruptToken>,
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// The calling thread's current token, if any was installed.
pub fn current() -> Option<InterruptToken> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// True if the calling thread's current token has fired.
pub fn is_interrupted() -> bool {
    CURRENT.with(|slot| slot.borrow().as_ref().is_some_and(InterruptToken::is_interrupted))
}

/// Fail with [`Interrupted`] if the calling thread has been interrupted.
pub fn check(what: &str) -> Result<(), Interrupted> {
    if is_interrupted() {
        Err(Interrupted::new(what))
    } else {
        Ok(())
    }
}

/// Sleep for `duration`, returning early with [`Interrupted`] if the calling
/// thread's current token fires.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    sleep_with_poll(duration, DEFAULT_POLL_INTERVAL)
}

/// [`sleep`] with an explicit polling slice.
pub fn sleep_with_poll(duration: Duration, poll: Duration) -> Result<(), Interrupted> {
    let Some(token) = current() else {
        std::thread::sleep(duration);
        return Ok(());
    };
    let deadline = Instant::now() + duration;
    let poll = poll.max(Duration::from_millis(1));
    loop {
        token.check("sleeping")?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_not_interrupted() {
        let token = InterruptToken::new();
        assert!(!token.is_interrupted());
        assert!(token.check("idle").is_ok());
    }

    #[test]
    fn test_clones_share_flag() {
        let token = InterruptToken::new();
        let clone = token.clone();
        clone.interrupt();
        assert!(token.is_interrupted());
        assert!(token.same_as(&clone));
    }

    #[test]
    fn test_child_follows_parent_but_not_reverse() {
        let parent = InterruptToken::new();
        let child = parent.child();
        let grandchild = child.child();

        child.interrupt();
        assert!(!parent.is_interrupted());
        assert!(grandchild.is_interrupted());

        let other = parent.child();
        assert!(!other.is_interrupted());
        parent.interrupt();
        assert!(other.is_interrupted());
    }

    #[test]
    fn test_install_restores_previous() {
        assert!(current().is_none());
        let outer = InterruptToken::new();
        let inner = InterruptToken::new();
        {
            let _outer_scope = outer.install();
            {
                let _inner_scope = inner.install();
                assert!(current().is_some_and(|t| t.same_as(&inner)));
            }
            assert!(current().is_some_and(|t| t.same_as(&outer)));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_sleep_without_token_completes() {
        assert!(sleep(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_sleep_returns_early_when_interrupted() {
        let token = InterruptToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            let _scope = token.install();
            let start = Instant::now();
            let result = sleep(Duration::from_secs(30));
            (result, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(30));
        remote.interrupt();
        let (result, elapsed) = handle.join().expect("sleeper thread");
        assert!(result.is_err());
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_check_uses_current_token() {
        let token = InterruptToken::new();
        let _scope = token.install();
        assert!(check("working").is_ok());
        token.interrupt();
        let err = check("working").expect_err("should be interrupted");
        assert_eq!(err.what, "working");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Interrupting one link of a token chain reaches every
            /// descendant and no ancestor.
            #[test]
            fn prop_interrupt_flows_down_the_chain(depth in 1usize..8, at in 0usize..8) {
                let at = at % depth;
                let mut chain = vec![InterruptToken::new()];
                for level in 1..depth {
                    let child = chain[level - 1].child();
                    chain.push(child);
                }

                chain[at].interrupt();
                for (level, token) in chain.iter().enumerate() {
                    prop_assert_eq!(token.is_interrupted(), level >= at);
                }
            }
        }
    }
}
