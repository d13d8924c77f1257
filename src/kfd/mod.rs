pub mod device;
pub mod interface;
pub mod mqd;
pub mod regs;
