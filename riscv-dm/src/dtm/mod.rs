//! Debug transport modules giving access to the Debug Module Interface.

pub mod jtag_dtm;
