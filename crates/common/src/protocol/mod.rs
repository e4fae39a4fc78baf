// Wire protocol shared by the relay and its clients.

pub mod ws;
