// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{cell::RefCell, fmt::Debug, future::Future, rc::Rc};

use larder_common::{fatal, fatal_assert};

use crate::{
    coroutine::{CoroContext, Coroutine},
    scheduler::Scheduler,
};

struct TaskState<T> {
    result: Option<T>,
    waiters: Vec<Coroutine>,
    callback: Option<Box<dyn FnOnce(T)>>,
    finished: bool,
}

/// A function running on its own coroutine, with a joinable result.
///
/// Either [`Task::join`] it from another coroutine or attach a [`Task::callback`]. Both consume
/// the task, so it can be observed at most once.
pub struct Task<T> {
    state: Rc<RefCell<TaskState<T>>>,
    coroutine: Coroutine,
}

impl<T> Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("coroutine", &self.coroutine)
            .field("finished", &self.state.borrow().finished)
            .finish()
    }
}

impl Scheduler {
    /// Spawn `f` on a new coroutine and return a [`Task`] for its result.
    pub fn spawn_task<F, Fut, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(CoroContext) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let state = Rc::new(RefCell::new(TaskState {
            result: None,
            waiters: vec![],
            callback: None,
            finished: false,
        }));

        let s = state.clone();
        let coroutine = self.spawn(move |ctx| {
            let future = f(ctx);
            async move {
                let value = future.await;
                Task::finish(&s, value);
            }
        });

        Task { state, coroutine }
    }
}

impl<T> Task<T>
where
    T: 'static,
{
    fn finish(state: &Rc<RefCell<TaskState<T>>>, value: T) {
        let mut s = state.borrow_mut();
        s.finished = true;
        if let Some(callback) = s.callback.take() {
            drop(s);
            callback(value);
            return;
        }
        s.result = Some(value);
        let waiters = std::mem::take(&mut s.waiters);
        drop(s);
        for waiter in waiters {
            waiter.notify();
        }
    }

    /// The coroutine running the task.
    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    /// Returns `true` once the task's function has returned.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Suspend the calling coroutine (not the OS thread) until the task finishes, then return
    /// its result.
    pub async fn join(self, ctx: &CoroContext) -> T {
        {
            let mut s = self.state.borrow_mut();
            if let Some(value) = s.result.take() {
                fatal_assert!(s.waiters.is_empty(), "task joined with {} pending waiters", s.waiters.len());
                return value;
            }
            fatal_assert!(
                s.waiters.is_empty(),
                "task {} already has a joiner",
                self.coroutine.id()
            );
            s.waiters.push(ctx.current().clone());
        }

        ctx.wait().await;

        let mut s = self.state.borrow_mut();
        fatal_assert!(s.waiters.is_empty(), "task joined with {} pending waiters", s.waiters.len());
        match s.result.take() {
            Some(value) => value,
            None => fatal!("{} resumed from join before task {} finished", ctx.current().id(), self.coroutine.id()),
        }
    }

    /// Invoke `callback` with the result once the task finishes, without blocking anyone.
    ///
    /// Runs immediately if the task has already finished.
    pub fn callback<F>(self, callback: F)
    where
        F: FnOnce(T) + 'static,
    {
        let mut s = self.state.borrow_mut();
        if let Some(value) = s.result.take() {
            drop(s);
            callback(value);
            return;
        }
        s.callback = Some(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn run_until_empty(scheduler: &Scheduler) {
        while scheduler.run_ready() > 0 {}
    }

    #[test_log::test]
    fn test_join_finished_task() {
        let scheduler = Scheduler::new();
        let out = Rc::new(Cell::new(0));

        let task = scheduler.spawn_task(|_| async move { 42u64 });
        run_until_empty(&scheduler);
        assert!(task.is_finished());

        let o = out.clone();
        scheduler.spawn(move |ctx| async move {
            o.set(task.join(&ctx).await);
        });
        run_until_empty(&scheduler);
        assert_eq!(out.get(), 42);
        assert!(scheduler.is_empty());
    }

    #[test_log::test]
    fn test_join_pending_task() {
        let scheduler = Scheduler::new();
        let out = Rc::new(RefCell::new(None));
        let gate = Rc::new(RefCell::new(None));

        let g = gate.clone();
        let task = scheduler.spawn_task(move |ctx| async move {
            *g.borrow_mut() = Some(ctx.current().clone());
            ctx.wait().await;
            String::from("done")
        });

        let o = out.clone();
        let joiner = scheduler.spawn(move |ctx| async move {
            let v = task.join(&ctx).await;
            *o.borrow_mut() = Some(v);
        });

        run_until_empty(&scheduler);
        assert!(out.borrow().is_none());
        assert!(!joiner.is_dead());

        gate.borrow_mut().take().unwrap().notify();
        run_until_empty(&scheduler);
        assert_eq!(out.borrow().as_deref(), Some("done"));
        assert!(joiner.is_dead());
    }

    #[test_log::test]
    fn test_callback() {
        let scheduler = Scheduler::new();
        let out = Rc::new(Cell::new(0));

        // Attached before completion.
        let o = out.clone();
        scheduler
            .spawn_task(|ctx| async move {
                ctx.yield_now().await;
                7
            })
            .callback(move |v| o.set(o.get() + v));
        run_until_empty(&scheduler);
        assert_eq!(out.get(), 7);

        // Attached after completion.
        let task = scheduler.spawn_task(|_| async move { 3 });
        run_until_empty(&scheduler);
        let o = out.clone();
        task.callback(move |v| o.set(o.get() + v));
        assert_eq!(out.get(), 10);
    }
}
