pub mod background;
pub mod conversations;
pub mod db;
pub mod recv_dispatcher;
pub mod recv_msgs;
pub mod reconciler;
pub mod send_pipeline;
pub mod wire;
