use tokio::sync::mpsc;

/// Holds items until a sink is attached, then forwards them in arrival order.
pub(crate) struct CandidateQueue<T> {
    buffered: Vec<T>,
    sink: Option<mpsc::UnboundedSender<T>>,
}

impl<T> Default for CandidateQueue<T> {
    fn default() -> Self {
        Self {
            buffered: Vec::new(),
            sink: None,
        }
    }
}

impl<T> CandidateQueue<T> {
    pub(crate) fn push(&mut self, item: T) {
        match &self.sink {
            Some(sink) => {
                if let Err(mpsc::error::SendError(item)) = sink.send(item) {
                    // Sink went away; go back to buffering.
                    self.sink = None;
                    self.buffered.push(item);
                }
            }
            None => self.buffered.push(item),
        }
    }

    /// Flushes everything buffered into `sink` and forwards later items
    /// directly.
    pub(crate) fn attach(&mut self, sink: mpsc::UnboundedSender<T>) {
        let mut pending = std::mem::take(&mut self.buffered).into_iter();
        while let Some(item) = pending.next() {
            if let Err(mpsc::error::SendError(item)) = sink.send(item) {
                self.buffered.push(item);
                self.buffered.extend(pending);
                return;
            }
        }
        self.sink = Some(sink);
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.sink.is_some()
    }
}
