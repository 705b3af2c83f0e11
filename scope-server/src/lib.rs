pub mod capture;
pub mod connectivity;
pub mod events;
pub mod jobs;
pub mod media;
pub mod mjpeg;
pub mod motion;
pub mod recording;
pub mod rig;
pub mod server;
pub mod settings;
pub mod state;
pub mod ws_log_stream;
pub mod ws_stream;
