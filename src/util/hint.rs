/// Run `f` on a path the optimizer should treat as unlikely, such as a
/// batch flush that only one write in thousands triggers.
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
