/// A strategy for waiting in spin loops that do not go through a scheduler.
pub trait Relax {
    fn relax();
}

/// Issue the architecture's spin-loop hint between probes.
pub struct SpinRelax;

/// Busy-loop with no hint. For the rare loop where the hint itself is
/// unavailable or unwanted.
pub struct LoopRelax;

impl Relax for SpinRelax {
    fn relax() {
        core::hint::spin_loop();
    }
}

impl Relax for LoopRelax {
    fn relax() {}
}
