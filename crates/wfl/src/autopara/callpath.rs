//! A thread-local record of the operations currently being dispatched, used to
//! pick a remote-info entry when the caller does not pass an explicit label.
//!
//! Each frame is a `file::function` string. Orchestration code pushes a frame
//! with [enter] (or the [frame!](crate::frame) macro) for as long as the
//! returned guard lives:
//!
//! ```
//! use wfl::autopara::callpath;
//!
//! let _outer = callpath::enter("workflow.rs::fit");
//! {
//!     let _inner = callpath::enter("calculators/generic.rs::calculate");
//!     assert_eq!(callpath::current().frames().len(), 2);
//! }
//! assert_eq!(callpath::current().frames(), ["workflow.rs::fit"]);
//! ```

use std::{
    cell::{Cell, RefCell},
    marker::PhantomData,
};

thread_local! {
    /// the live frames, tagged with the id of the guard that pushed them
    static FRAMES: RefCell<Vec<(u64, String)>> =
        const { RefCell::new(Vec::new()) };
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Frames belonging to the dispatch machinery itself. Trailing frames with
/// these suffixes are dropped before matching so that the match reflects the
/// operation being parallelized rather than the entry point doing it.
pub const PASS_THROUGH: [&str; 3] = [
    "autopara/base.rs::autoparallelize",
    "autopara/base.rs::autoparallelize_ll",
    "autopara/utils.rs::get_remote_info",
];

/// An ordered list of `file::function` frames, outermost first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallPath(Vec<String>);

impl CallPath {
    pub fn new<S: Into<String>>(frames: impl IntoIterator<Item = S>) -> Self {
        Self(frames.into_iter().map(Into::into).collect())
    }

    pub fn frames(&self) -> &[String] {
        &self.0
    }

    /// the frames with any trailing [PASS_THROUGH] frames removed
    pub fn effective(&self) -> &[String] {
        let mut frames = self.0.as_slice();
        while let Some((last, rest)) = frames.split_last() {
            if !PASS_THROUGH.iter().any(|p| last.ends_with(p)) {
                break;
            }
            frames = rest;
        }
        frames
    }
}

/// Removes its own frame when dropped, even if frames pushed after it are
/// still live. Not `Send`, since the frame lives on the current thread's stack
#[must_use = "the frame is removed as soon as the guard is dropped"]
pub struct FrameGuard {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with_borrow_mut(|f| {
            if let Some(i) = f.iter().rposition(|(id, _)| *id == self.id) {
                f.remove(i);
            }
        });
    }
}

/// push `frame` onto the current thread's call path until the returned guard
/// is dropped
pub fn enter(frame: impl Into<String>) -> FrameGuard {
    let frame = frame.into();
    log::trace!("entering {frame}");
    let id = NEXT_ID.replace(NEXT_ID.get() + 1);
    FRAMES.with_borrow_mut(|f| f.push((id, frame)));
    FrameGuard {
        id,
        _not_send: PhantomData,
    }
}

/// a snapshot of the current thread's call path
pub fn current() -> CallPath {
    FRAMES.with_borrow(|f| {
        CallPath(f.iter().map(|(_, frame)| frame.clone()).collect())
    })
}

/// push a frame named after the current source file and `$name`
#[macro_export]
macro_rules! frame {
    ($name:expr) => {
        $crate::autopara::callpath::enter(concat!(file!(), "::", $name))
    };
}
