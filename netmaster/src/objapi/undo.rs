use anyhow::Result;
use futures::future::BoxFuture;
use log::{info, warn};

/// Compensating actions recorded while a multi-step create runs. On
/// failure they are replayed newest first; on success they are dropped.
#[derive(Default)]
pub struct UndoStack<'a> {
    steps: Vec<(String, BoxFuture<'a, Result<()>>)>,
}

impl<'a> UndoStack<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, what: impl Into<String>, undo: BoxFuture<'a, Result<()>>) {
        self.steps.push((what.into(), undo));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every compensation. Their own failures are logged only.
    pub async fn unwind(mut self) {
        while let Some((what, undo)) = self.steps.pop() {
            info!("undoing {what}");
            if let Err(e) = undo.await {
                warn!("failed to undo {what}: {e}");
            }
        }
    }

    pub fn commit(self) {}

    /// Unwinds on error and hands the result back.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.commit();
                Ok(v)
            }
            Err(e) => {
                self.unwind().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn unwinds_in_reverse_and_survives_failures() {
        let order = Mutex::new(Vec::new());
        let mut undo = UndoStack::new();
        for i in 0..3 {
            let order = &order;
            undo.push(
                format!("step {i}"),
                async move {
                    order.lock().unwrap().push(i);
                    if i == 1 {
                        bail!("boom");
                    }
                    Ok(())
                }
                .boxed(),
            );
        }
        assert_eq!(undo.len(), 3);
        let res: Result<()> = undo.finish(Err(anyhow::anyhow!("create failed"))).await;
        assert!(res.is_err());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn commit_skips_compensation() {
        let ran = Mutex::new(false);
        let mut undo = UndoStack::new();
        undo.push(
            "noop",
            async {
                *ran.lock().unwrap() = true;
                Ok(())
            }
            .boxed(),
        );
        assert_eq!(undo.finish(Ok(5)).await.unwrap(), 5);
        assert!(!*ran.lock().unwrap());
    }
}
