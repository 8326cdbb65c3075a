use crate::config::Settings;
use crate::downloads::StatusStore;
use crate::feed::FeedState;
use crate::notifier::ChangeNotifier;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub store: StatusStore,
    pub notifier: ChangeNotifier,
    pub feed_state: watch::Receiver<FeedState>,
    pub shutdown: CancellationToken,
}
