use crate::{
    Error, LogConfig,
    event::EventSet,
    journal::Journal,
    notification::{Notification, NotificationLog, NotificationLogId},
    store::EventStore,
};

/// Builds notification log pages over an [`EventStore`].
#[derive(Debug, Clone)]
pub struct NotificationLogFactory<J: Journal> {
    store: EventStore<J>,
    page_size: u64,
}

impl<J: Journal> NotificationLogFactory<J> {
    /// A factory with the configured page size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the page size is zero.
    pub fn new(store: EventStore<J>, config: &LogConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            store,
            page_size: config.page_size,
        })
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Id of the page the next event will land in, or the page holding the
    /// last event when that page is exactly full.
    #[must_use]
    pub fn current_id(&self) -> NotificationLogId {
        current_id(self.store.count(), self.page_size)
    }

    /// The current, still-filling page. Never archived.
    ///
    /// # Errors
    ///
    /// Returns an error if an event cannot be read or decoded into `E`.
    pub async fn create_current<E: EventSet>(&self) -> Result<NotificationLog<E>, Error> {
        let count = self.store.count();
        self.create_at(current_id(count, self.page_size), count).await
    }

    /// The page `id`, archived if a later event exists.
    ///
    /// An id beyond the current page, or one that does not sit on this
    /// factory's page boundaries, yields an empty, non-archived page without
    /// links.
    ///
    /// # Errors
    ///
    /// Returns an error if an event cannot be read or decoded into `E`.
    pub async fn create<E: EventSet>(&self, id: NotificationLogId) -> Result<NotificationLog<E>, Error> {
        if !id.is_page(self.page_size) {
            tracing::debug!(%id, page_size = self.page_size, "log id is not a page");
            return Ok(NotificationLog {
                id,
                next_id: None,
                previous_id: None,
                notifications: Vec::new(),
                archived: false,
            });
        }
        self.create_at(id, self.store.count()).await
    }

    #[tracing::instrument(skip(self, id), fields(id = %id))]
    async fn create_at<E: EventSet>(&self, id: NotificationLogId, count: u64) -> Result<NotificationLog<E>, Error> {
        let notifications = self
            .store
            .events_between(id.low(), id.high())
            .await?
            .iter()
            .map(Notification::from_stored)
            .collect::<Result<Vec<_>, _>>()?;

        let archived = id.high() < count;
        tracing::trace!(archived, notifications = notifications.len(), "notification log created");
        Ok(NotificationLog {
            id,
            next_id: if archived { id.next(self.page_size) } else { None },
            previous_id: id.previous(self.page_size),
            notifications,
            archived,
        })
    }
}

fn current_id(count: u64, page_size: u64) -> NotificationLogId {
    let mut remainder = count % page_size;
    if remainder == 0 && count > 0 {
        remainder = page_size;
    }
    let low = count - remainder + 1;
    NotificationLogId::new(low, low + page_size - 1)
}
