pub mod activation;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod orders;
pub mod razorpay;
pub mod store;

pub use activation::SubscriptionService;
pub use metrics::{init_metrics, render_metrics};
pub use notifier::{MockNotifier, Notifier, SmtpNotifier};
pub use orders::OrderService;
pub use razorpay::RazorpayClient;
pub use store::{
    MongoPaymentStore, MongoSubscriptionStore, PaymentStore, StoreError, SubscriptionStore,
};
