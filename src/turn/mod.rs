//! Turn-taking between the user and the assistant

mod controller;
mod dispatcher;
mod state;

pub use controller::{
    CALIBRATION_DEADLINE, DEFAULT_CALIBRATION_WINDOW, DEFAULT_FRAME_QUEUE_DEPTH, TurnController,
    TurnHandle, TurnSettings,
};
pub use dispatcher::{FunctionCallDispatcher, FunctionHandler};
pub use state::{SessionEvent, TurnState};
