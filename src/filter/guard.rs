//! Reentrancy guard
//!
//! Records, per task, which filters are currently running. A filter that finds
//! its own id already recorded has been wrapped around itself and must not
//! cache a second time.

use std::cell::RefCell;
use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static ACTIVE: RefCell<Vec<Uuid>>;
}

/// True if filter `id` is already running in the current task
pub fn is_active(id: Uuid) -> bool {
    ACTIVE
        .try_with(|active| active.borrow().contains(&id))
        .unwrap_or(false)
}

/// Run `fut` with filter `id` marked active.
///
/// The mark is removed when `fut` completes, panics or is dropped.
pub async fn guarded<F: Future>(id: Uuid, fut: F) -> F::Output {
    if ACTIVE.try_with(|_| ()).is_ok() {
        let _entered = Entered::push(id);
        fut.await
    } else {
        ACTIVE
            .scope(RefCell::new(Vec::new()), async move {
                let _entered = Entered::push(id);
                fut.await
            })
            .await
    }
}

struct Entered(Uuid);

impl Entered {
    fn push(id: Uuid) -> Self {
        let _ = ACTIVE.try_with(|active| active.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        let id = self.0;
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|entry| *entry == id) {
                active.remove(pos);
            }
        });
    }
}
