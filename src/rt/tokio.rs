/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::{future::Future, pin::Pin};

use super::{Runtime, Sleep, TaskHandle};

pub struct TokioRuntime {}

impl TaskHandle for tokio::task::JoinHandle<()> {
    fn abort(&self) {
        self.abort()
    }
}

impl Sleep for tokio::time::Sleep {}

impl Runtime for TokioRuntime {
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle> {
        Box::new(tokio::spawn(task))
    }

    fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::{Runtime, TokioRuntime};
    use std::time::Duration;

    #[tokio::test]
    async fn sleep_completes() {
        let runtime = TokioRuntime {};
        runtime.sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn spawned_task_runs() {
        let runtime = TokioRuntime {};
        let (tx, rx) = tokio::sync::oneshot::channel();
        runtime.spawn(Box::pin(async move {
            let _ = tx.send(());
        }));
        rx.await.unwrap();
    }
}
