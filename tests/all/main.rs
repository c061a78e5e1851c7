mod helpers;
mod pool;
mod receivers;
mod registry;
mod senders;
