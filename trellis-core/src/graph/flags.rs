//! Status flags carried alongside node values.

bitflags::bitflags! {
    /// Sticky status bits that travel through the graph independently of
    /// value equality.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// The node's last evaluation failed; its value slot holds the error.
        const ERROR = 1 << 0;
        /// The node's value is still loading.
        const LOADING = 1 << 1;
    }
}

impl Flags {
    /// Handler mask given to every new computation.
    pub const DEFAULT_HANDLER: Flags = Flags::ERROR;
}
