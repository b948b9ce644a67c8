#![doc = include_str!("../README.md")]

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod propagation;
pub mod receiver;
mod sender;
pub mod telemetry;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use channel::{ChannelError, ChannelErrorKind, Queue, QueueChannel, QueueOptions};

#[doc(inline)]
pub use codec::{Codec, CodecError, Json};

#[doc(inline)]
pub use propagation::{PropagationContext, Propagator};

#[doc(inline)]
pub use telemetry::Telemetry;

#[doc(inline)]
pub use sender::{MessageSender, SendError, SendErrorKind};

#[doc(inline)]
pub use receiver::{
    AckMode, DefaultReceiverHook, Handler, MessageReceiver, ReceiverHook, ReceiverOptions,
    SubscribeError, SubscribeErrorKind, Subscription, SubscriptionState,
};
