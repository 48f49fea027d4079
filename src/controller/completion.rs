/// A connect request is done only when both the local connection attempt produced a connection
///  ('established') and the peer confirmed that it accepts the connection ('accepted'). The two
///  signals arrive independently and in any order, and whichever comes second releases the
///  connection.
///
/// A connection that is established but never accepted is dropped (and thereby closed) together
///  with the race.
#[derive(Debug)]
pub struct CompletionRace<T> {
    established: Option<T>,
    accepted: bool,
}

impl<T> Default for CompletionRace<T> {
    fn default() -> Self {
        CompletionRace {
            established: None,
            accepted: false,
        }
    }
}

impl<T> CompletionRace<T> {
    #[must_use]
    pub fn on_established(&mut self, connection: T) -> Option<T> {
        if self.accepted {
            Some(connection)
        }
        else {
            self.established = Some(connection);
            None
        }
    }

    #[must_use]
    pub fn on_accepted(&mut self) -> Option<T> {
        self.accepted = true;
        self.established.take()
    }

    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }
}
