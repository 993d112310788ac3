pub mod preemption_channel;

pub use preemption_channel::{run_preemption_channel, ClaimEvent, EmergencyClaim, PreemptionChannel};
