use std::{collections::VecDeque, rc::Rc};

// one broadcast allocates one block; every recipient's queue entry holds a
// reference to it and the block goes away together with the last entry.
// execution is single threaded, so the count does not need to be atomic
#[derive(Debug, Clone)]
pub struct Payload(Rc<[u8]>);

impl Payload {
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // number of live references to the block, this handle included
    pub fn handles(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
struct Entry {
    payload: Payload,
    offset: usize,
}

// per-task FIFO of the bytes still to be delivered on the task's socket.
// the head entry always has unsent bytes left
#[derive(Debug, Default)]
pub struct WriteQueue(VecDeque<Entry>);

impl WriteQueue {
    pub fn push(&mut self, payload: Payload) {
        if payload.is_empty() {
            return;
        }
        self.0.push_back(Entry { payload, offset: 0 })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn head(&self) -> Option<(Payload, usize)> {
        self.0.front().map(|entry| (entry.payload.clone(), entry.offset))
    }

    // account `n` bytes of the head entry as sent, unlinking the entry (and
    // releasing its payload reference) once nothing of it remains unsent
    pub fn advance(&mut self, n: usize) {
        let Some(head) = self.0.front_mut() else {
            return;
        };
        head.offset += n;
        debug_assert!(head.offset <= head.payload.len());
        if head.offset >= head.payload.len() {
            self.0.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }
}
