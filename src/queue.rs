// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Mutex guarded FIFO shared between board workers

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append `item`, returns false (and drops the item) when the queue is full
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().expect("queue lock");
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().expect("queue lock").drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all items, returns how many were queued
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().expect("queue lock");
        let count = items.len();
        items.clear();
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::new(3);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert!(!queue.push(4), "full queue accepted item");
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert!(queue.push(4));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(Queue::new(1000));
        let producers: Vec<_> = (0..4)
            .map(|id| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        assert!(queue.push(id * 1000 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer panicked");
        }
        let items = queue.drain();
        assert_eq!(items.len(), 400);
        // per producer order is kept
        for id in 0..4 {
            let own: Vec<_> = items.iter().filter(|item| **item / 1000 == id).collect();
            assert!(own.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert_eq!(queue.clear(), 0);
    }
}
