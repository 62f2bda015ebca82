//! Disco-mode LED cycler.
//!
//! Steps the machine's LED ring through caller-registered color schemes.
//! The scheme commands are opaque byte strings and the send function is
//! injected at construction, so the cycler never back-references the
//! connection supervisor.

use anyhow::Result;
use std::sync::Arc;

/// Injected command sink; typically wraps `OperationQueue::write` on TX.
pub type SendCommandFn = Arc<dyn Fn(Vec<u8>) -> Result<()> + Send + Sync>;

pub struct DiscoModeCycler {
    send: SendCommandFn,
    /// Opaque scheme commands registered by the outer system.
    schemes: Vec<Vec<u8>>,
    last_scheme_index: usize,
}

impl DiscoModeCycler {
    pub fn new(send: SendCommandFn) -> Self {
        Self {
            send,
            schemes: Vec::new(),
            last_scheme_index: 0,
        }
    }

    /// Registers the scheme command list. Until this is called the cycler is
    /// a safe no-op.
    pub fn set_schemes(&mut self, schemes: Vec<Vec<u8>>) {
        self.schemes = schemes;
        self.last_scheme_index = 0;
    }

    /// Persists the scheme position chosen by the outer system.
    pub fn set_last_color_scheme_index(&mut self, index: usize) {
        self.last_scheme_index = index;
    }

    pub fn last_color_scheme_index(&self) -> usize {
        self.last_scheme_index
    }

    /// Sends the next scheme command, wrapping at the end of the list.
    pub fn advance(&mut self) -> Result<()> {
        if self.schemes.is_empty() {
            return Ok(());
        }
        let next = (self.last_scheme_index + 1) % self.schemes.len();
        (self.send)(self.schemes[next].clone())?;
        self.last_scheme_index = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_cycler() -> (DiscoModeCycler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let cycler = DiscoModeCycler::new(Arc::new(move |bytes| {
            sink.lock().unwrap().push(bytes);
            Ok(())
        }));
        (cycler, sent)
    }

    #[test]
    fn test_advance_without_schemes_is_no_op() {
        let (mut cycler, sent) = recording_cycler();
        cycler.advance().unwrap();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_advance_cycles_and_wraps() {
        let (mut cycler, sent) = recording_cycler();
        cycler.set_schemes(vec![vec![0x01], vec![0x02], vec![0x03]]);
        for _ in 0..4 {
            cycler.advance().unwrap();
        }
        assert_eq!(
            *sent.lock().unwrap(),
            vec![vec![0x02], vec![0x03], vec![0x01], vec![0x02]]
        );
        assert_eq!(cycler.last_color_scheme_index(), 1);
    }

    #[test]
    fn test_index_passthrough_redirects_cycle() {
        let (mut cycler, sent) = recording_cycler();
        cycler.set_schemes(vec![vec![0x01], vec![0x02], vec![0x03]]);
        cycler.set_last_color_scheme_index(2);
        cycler.advance().unwrap();
        assert_eq!(*sent.lock().unwrap(), vec![vec![0x01]]);
    }
}
