use crate::connection::{Connection, ConnectionError};
use crate::envelopes::Envelope;
use crate::{Event, Filter};
use tokio::sync::mpsc;

/// notifications delivered to the owner of a subscription
#[derive(Debug)]
pub enum SubscriptionUpdate {
    /// an event matching the subscription filters
    Event(Event),
    /// the relay has sent all stored events; future matches stream live
    EndOfStored,
    /// the subscription was closed, with the relay-provided reason
    Closed(String),
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionParams {
    /// caller-provided subscription id; minted from the connection serial otherwise
    pub id: Option<String>,
}

/// a standing query on a relay
///
/// created by [`Connection::prepare_subscription`], which registers the
/// handle without sending anything; [`Subscription::fire`] puts the REQ on
/// the wire. updates arrive through [`Subscription::recv`].
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    connection: Connection,
    updates: mpsc::Receiver<SubscriptionUpdate>,
    fired: bool,
}

impl Subscription {
    pub(crate) fn new(
        connection: Connection,
        id: String,
        filters: Vec<Filter>,
        updates: mpsc::Receiver<SubscriptionUpdate>,
    ) -> Self {
        Self {
            id,
            filters,
            connection,
            updates,
            fired: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// transmit the REQ frame for this subscription
    pub async fn fire(&mut self) -> Result<(), ConnectionError> {
        if self.fired {
            return Ok(());
        }

        self.connection
            .send(&Envelope::Req {
                subscription_id: self.id.clone(),
                filters: self.filters.clone(),
            })
            .await?;
        self.fired = true;

        // if the relay never answers with EOSE, synthesize one
        self.connection.arm_eose_timer(self.id.clone());

        Ok(())
    }

    /// receive the next update; `None` after the subscription ends
    pub async fn recv(&mut self) -> Option<SubscriptionUpdate> {
        self.updates.recv().await
    }

    /// close the subscription and remove it from the connection registry
    pub async fn close(mut self) -> Result<(), ConnectionError> {
        self.connection.forget_subscription(&self.id);
        self.updates.close();

        if self.fired {
            self.connection
                .send(&Envelope::Close {
                    subscription_id: self.id.clone(),
                })
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("fired", &self.fired)
            .finish()
    }
}
