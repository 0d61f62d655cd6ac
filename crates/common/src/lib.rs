// fanline-common: wire protocol types shared by the relay and its clients

pub mod channel;
pub mod protocol;
