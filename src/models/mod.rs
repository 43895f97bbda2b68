pub mod courier;
pub mod event;
pub mod offer;
pub mod order;
