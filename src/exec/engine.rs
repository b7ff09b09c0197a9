use super::driver::{Cancel, Dispatch, DispatchError, DispatchReport, Driver};
use crate::platform;

#[derive(Debug)]
pub enum EngineEvent {
    Dispatch {
        dispatch: Dispatch,
        cancel: Cancel,
        sender: flume::Sender<Result<DispatchReport, DispatchError>>,
    },
}

/// Handle to a running execution engine.
///
/// Dispatches are submitted over a channel and executed by a serve loop off
/// the async executor; results come back over the event's reply channel.
#[derive(Debug, Clone)]
pub struct Engine {
    sender: flume::Sender<EngineEvent>,
}

impl Engine {
    pub fn submit(&self, event: EngineEvent) {
        _ = self.sender.send(event)
    }

    /// Validates nothing further; the `ProgramData` inside `dispatch` is
    /// already the proof of binding. Runs the dispatch to completion.
    pub async fn dispatch(&self, dispatch: Dispatch) -> Result<DispatchReport, DispatchError> {
        self.dispatch_with(dispatch, Cancel::new()).await
    }

    /// Like [`dispatch`](Self::dispatch), with a caller-held cancellation
    /// token.
    pub async fn dispatch_with(
        &self,
        dispatch: Dispatch,
        cancel: Cancel,
    ) -> Result<DispatchReport, DispatchError> {
        let (sender, receiver) = flume::bounded(0);
        self.submit(EngineEvent::Dispatch {
            dispatch,
            cancel,
            sender,
        });
        let report = receiver.recv_async().await??;
        Ok(report)
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineBuilder {
    pub driver: Driver,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits each workgroup into at most `coroutines` coroutines.
    pub fn coroutines(mut self, coroutines: usize) -> Self {
        self.driver = Driver::new(coroutines);
        self
    }

    pub async fn build(self) -> Engine {
        let (sender, receiver) = flume::unbounded();
        platform::spawn(serve(self.driver, receiver));
        Engine { sender }
    }
}

async fn serve(driver: Driver, receiver: flume::Receiver<EngineEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            EngineEvent::Dispatch {
                dispatch,
                cancel,
                sender,
            } => {
                let driver = driver.clone();
                let result = platform::handle(move || driver.dispatch(&dispatch, &cancel)).await;
                if let Err(err) = &result {
                    log::error!("dispatch failed: {err}");
                }
                _ = sender.send_async(result).await;
            }
        }
    }
}
