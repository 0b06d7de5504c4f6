//! Single-threaded FIFO task queue standing in for the host's message loop.
//!
//! Every channel delivery is posted here; nothing is delivered synchronously
//! from `send`. Callers drive the loop with [`EventLoop::run_until_idle`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

#[derive(Clone, Default)]
pub struct EventLoop {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run tasks (including ones posted while running) until the queue is
    /// empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // Release the borrow before running: tasks post more tasks.
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}
