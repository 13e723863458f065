//! A filtering proxy for the Tor control port.
//!
//! See the `arti_ctlfilter` library crate for documentation.

fn main() {
    arti_ctlfilter::main();
}
