/// Progress update callbacks for flash and memory writes
pub trait ProgressCallbacks {
    /// A write of `total` blocks at `addr` is starting
    fn init(&mut self, addr: u32, total: usize);
    /// Block `current` is about to be written
    fn update(&mut self, current: usize);
    /// The write has finished
    fn finish(&mut self);
}
