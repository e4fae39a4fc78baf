// cosync-common: wire protocol shared by the cosync relay and its clients

pub mod protocol;
