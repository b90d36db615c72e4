//! ToDo一覧のストア
//!
//! 利用者の操作は楽観的に即時反映し、リモート書き込みの結果で確定・巻き戻しを行う。
//! ライブフィードからの変更も同じストアに冪等に取り込む。
//!
//! 状態は `std::sync::Mutex` で保護し、ロックを `.await` をまたいで保持しない。
//! 非同期処理は開始時のスコープ世代を控え、完了時に世代が変わっていれば結果を捨てる。

use chrono::Utc;
use domain::{ChangeEvent, NewTodo, TodoId, TodoItem, TodoPatch, UserId};
use infrastructure::{Order, RowFilter, TodoTable};
use shared::telemetry::{record_app_error, trace_remote_operation};
use shared::{AppError, WriteOperation};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 画面側に公開する一覧の状態
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSnapshot {
    pub owner_id: Option<UserId>,
    pub items: Vec<TodoItem>,
    /// 入力中の本文
    pub draft: String,
    pub loading: bool,
    /// 直近のエラー（1件のみ保持）
    pub error: Option<AppError>,
}

impl ListSnapshot {
    pub fn get(&self, id: &TodoId) -> Option<&TodoItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(AppError::user_message)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 非同期処理の開始時点のスコープ
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scope {
    owner_id: UserId,
    generation: u64,
}

#[derive(Debug, Default)]
struct ListState {
    owner_id: Option<UserId>,
    generation: u64,
    items: Vec<TodoItem>,
    draft: String,
    loading: bool,
    error: Option<AppError>,
}

impl ListState {
    fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            owner_id: self.owner_id.clone(),
            items: self.items.clone(),
            draft: self.draft.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }

    fn scope(&self) -> Option<Scope> {
        self.owner_id.as_ref().map(|owner_id| Scope {
            owner_id: owner_id.clone(),
            generation: self.generation,
        })
    }

    fn is_current(&self, scope: &Scope) -> bool {
        self.generation == scope.generation && self.owner_id.as_ref() == Some(&scope.owner_id)
    }

    /// 所有者が変わる場合は全状態を破棄して世代を進める
    fn enter_scope(&mut self, owner_id: &UserId) -> Scope {
        if self.owner_id.as_ref() != Some(owner_id) {
            *self = ListState {
                owner_id: Some(owner_id.clone()),
                generation: self.generation + 1,
                ..ListState::default()
            };
        }
        Scope {
            owner_id: owner_id.clone(),
            generation: self.generation,
        }
    }

    fn clear(&mut self) {
        *self = ListState {
            generation: self.generation + 1,
            ..ListState::default()
        };
    }

    fn position_of(&self, id: &TodoId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }

    fn find_mut(&mut self, id: &TodoId) -> Option<&mut TodoItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    /// created_at 降順の位置に挿入する。同時刻なら後着を先頭側に置く
    fn insert_ordered(&mut self, item: TodoItem) {
        let index = self
            .items
            .iter()
            .position(|existing| existing.created_at <= item.created_at)
            .unwrap_or(self.items.len());
        self.items.insert(index, item);
    }

    /// 指定位置を置き換える。並び順が崩れる場合のみ挿入し直す
    fn replace_at(&mut self, index: usize, item: TodoItem) {
        let before_ok = index == 0 || self.items[index - 1].created_at >= item.created_at;
        let after_ok = index + 1 >= self.items.len()
            || self.items[index + 1].created_at <= item.created_at;

        if before_ok && after_ok {
            self.items[index] = item;
        } else {
            self.items.remove(index);
            self.insert_ordered(item);
        }
    }

    fn remove(&mut self, id: &TodoId) -> Option<TodoItem> {
        self.position_of(id).map(|index| self.items.remove(index))
    }

    /// 作成の確定応答を反映する
    fn confirm_created(&mut self, temporary_id: &TodoId, confirmed: TodoItem) {
        match (self.position_of(temporary_id), self.position_of(&confirmed.id)) {
            (Some(index), None) => self.replace_at(index, confirmed),
            // ライブフィードが先に届いていた
            (Some(index), Some(_)) => {
                self.items.remove(index);
            }
            // 反映済み、または確定前に削除・再取得された
            (None, _) => {}
        }
    }

    fn upsert_remote(&mut self, item: TodoItem) {
        if let Some(index) = self.position_of(&item.id) {
            self.replace_at(index, item);
            return;
        }

        // 自セッションの作成中エントリを確定レコードで置き換える
        let pending = self.items.iter().rposition(|existing| {
            existing.id.is_temporary()
                && existing.owner_id == item.owner_id
                && existing.content == item.content
        });
        match pending {
            Some(index) => self.replace_at(index, item),
            None => self.insert_ordered(item),
        }
    }

    fn update_remote(&mut self, item: TodoItem) -> bool {
        match self.position_of(&item.id) {
            Some(index) => {
                self.replace_at(index, item);
                true
            }
            None => false,
        }
    }

    fn accepts(&self, item: &TodoItem) -> bool {
        self.owner_id.as_ref() == Some(&item.owner_id)
    }
}

pub struct ListStore {
    table: Arc<dyn TodoTable>,
    state: Mutex<ListState>,
    changes: watch::Sender<ListSnapshot>,
}

impl ListStore {
    pub fn new(table: Arc<dyn TodoTable>) -> Self {
        let (changes, _) = watch::channel(ListSnapshot::default());
        Self {
            table,
            state: Mutex::new(ListState::default()),
            changes,
        }
    }

    /// 状態変化の通知を購読する
    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> ListSnapshot {
        self.state().snapshot()
    }

    pub fn owner_id(&self) -> Option<UserId> {
        self.state().owner_id.clone()
    }

    fn state(&self) -> MutexGuard<'_, ListState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 状態を変更して購読者に通知する
    fn mutate<R>(&self, f: impl FnOnce(&mut ListState) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.state();
            let result = f(&mut state);
            (result, state.snapshot())
        };
        self.changes.send_replace(snapshot);
        result
    }

    /// 一覧のスコープを指定ユーザーに切り替える（別ユーザーなら状態を破棄）
    pub fn rescope(&self, owner_id: &UserId) {
        self.mutate(|state| {
            state.enter_scope(owner_id);
        });
    }

    /// ユーザー単位の状態をすべて破棄する（サインアウト時）
    pub fn reset(&self) {
        self.mutate(ListState::clear);
        debug!("一覧の状態を破棄しました");
    }

    /// 全件を再取得して一覧を置き換える
    ///
    /// 作成確定待ちの仮エントリは残す。ただし取得結果に同じ作成の確定行が
    /// 含まれていれば仮エントリは捨てる。取得中にスコープが切り替わった場合は
    /// 結果を反映せず空の一覧を返す。
    pub async fn load_all(&self, owner_id: &UserId) -> Result<Vec<TodoItem>, AppError> {
        let scope = self.mutate(|state| {
            let scope = state.enter_scope(owner_id);
            state.loading = true;
            scope
        });

        let filter = RowFilter::owner(owner_id.clone());
        let result = trace_remote_operation(
            "select_all",
            Some(owner_id.as_str()),
            self.table.select_all(&filter, Order::CreatedAtDesc),
        )
        .await;

        match result {
            Ok(rows) => {
                let applied = self.mutate(|state| {
                    if !state.is_current(&scope) {
                        return None;
                    }

                    let (mut rows, foreign): (Vec<TodoItem>, Vec<TodoItem>) =
                        rows.into_iter().partition(|row| row.is_owned_by(owner_id));
                    if !foreign.is_empty() {
                        warn!(
                            owner_id = %owner_id,
                            count = foreign.len(),
                            "所有者の異なる行を除外しました"
                        );
                    }
                    Order::CreatedAtDesc.sort(&mut rows);

                    let (pending, confirmed): (Vec<TodoItem>, Vec<TodoItem>) = state
                        .items
                        .drain(..)
                        .partition(|item| item.id.is_temporary());
                    let known: HashSet<TodoId> =
                        confirmed.into_iter().map(|item| item.id).collect();

                    // 前回から増えた行のうち、作成中エントリと本文が一致するものは確定済みとみなす
                    let mut unclaimed: Vec<&TodoItem> =
                        rows.iter().filter(|row| !known.contains(&row.id)).collect();
                    state.items = rows.clone();
                    for item in pending.into_iter().rev() {
                        let superseded = unclaimed.iter().rposition(|row| {
                            row.owner_id == item.owner_id && row.content == item.content
                        });
                        match superseded {
                            Some(index) => {
                                let row = unclaimed.remove(index);
                                debug!(temporary_id = %item.id, todo_id = %row.id, "作成中エントリを確定済みの行に置き換えました");
                            }
                            None => state.insert_ordered(item),
                        }
                    }
                    state.loading = false;
                    Some(rows)
                });

                match applied {
                    Some(rows) => {
                        info!(owner_id = %owner_id, count = rows.len(), "一覧を読み込みました");
                        Ok(rows)
                    }
                    None => {
                        debug!(owner_id = %owner_id, "スコープが切り替わったため取得結果を破棄しました");
                        Ok(Vec::new())
                    }
                }
            }
            Err(e) => {
                let app_error = AppError::fetch(&e);
                let applied = self.mutate(|state| {
                    if !state.is_current(&scope) {
                        return false;
                    }
                    state.loading = false;
                    state.error = Some(app_error.clone());
                    true
                });
                if applied {
                    record_app_error(&app_error, "load_all");
                }
                Err(app_error)
            }
        }
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let text = text.into();
        self.mutate(|state| state.draft = text);
    }

    /// 入力中の本文で作成する
    ///
    /// 空白のみの入力は何もしない
    pub async fn submit_draft(&self) -> Result<(), AppError> {
        let draft = self.state().draft.clone();
        if draft.trim().is_empty() {
            debug!("入力が空のため作成しません");
            return Ok(());
        }
        self.add(&draft).await
    }

    /// 仮IDで先頭に追加し、リモート作成の結果で確定または取り消す
    pub async fn add(&self, content: &str) -> Result<(), AppError> {
        let now = Utc::now();
        let prepared = self.mutate(|state| -> Result<(Scope, TodoItem), AppError> {
            let scope = state.scope().ok_or(AppError::NotSignedIn)?;
            let item = TodoItem::optimistic(scope.owner_id.clone(), content, now)?;
            state.insert_ordered(item.clone());
            state.draft.clear();
            Ok((scope, item))
        });
        let (scope, optimistic) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report(e.clone());
                return Err(e);
            }
        };

        let record = NewTodo::from_item(&optimistic);
        let result = trace_remote_operation(
            "insert",
            Some(scope.owner_id.as_str()),
            self.table.insert(&record),
        )
        .await;

        match result {
            Ok(confirmed) => {
                let applied = self.mutate(|state| {
                    if !state.is_current(&scope) {
                        return false;
                    }
                    match confirmed {
                        Some(confirmed) if state.accepts(&confirmed) => {
                            state.confirm_created(&optimistic.id, confirmed);
                        }
                        Some(confirmed) => {
                            warn!(todo_id = %confirmed.id, "所有者の異なる確定レコードを無視しました");
                        }
                        // 確定レコードはライブフィードで届く
                        None => {}
                    }
                    true
                });
                if !applied {
                    debug!(temporary_id = %optimistic.id, "スコープが切り替わったため作成応答を破棄しました");
                }
                Ok(())
            }
            Err(e) => {
                let app_error = AppError::write(WriteOperation::Create, &e);
                let applied = self.mutate(|state| {
                    if !state.is_current(&scope) {
                        return false;
                    }
                    state.remove(&optimistic.id);
                    state.error = Some(app_error.clone());
                    true
                });
                if applied {
                    record_app_error(&app_error, "add");
                }
                Err(app_error)
            }
        }
    }

    /// 完了状態を反転し、失敗したら元の値に戻す
    pub async fn toggle(&self, id: &TodoId) -> Result<(), AppError> {
        let prepared = self.mutate(|state| -> Result<(Scope, bool), AppError> {
            let scope = state.scope().ok_or(AppError::NotSignedIn)?;
            if id.is_temporary() {
                return Err(AppError::Validation(format!("Todo {id} is still being saved")));
            }
            let item = state
                .find_mut(id)
                .ok_or_else(|| AppError::Validation(format!("Todo not found: {id}")))?;
            let previous = item.completed;
            item.completed = !previous;
            Ok((scope, previous))
        });
        let (scope, previous) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report(e.clone());
                return Err(e);
            }
        };

        let filter = RowFilter::row(id.clone(), scope.owner_id.clone());
        let result = trace_remote_operation(
            "update",
            Some(scope.owner_id.as_str()),
            self.table.update(&TodoPatch::completed(!previous), &filter),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let app_error = AppError::write(WriteOperation::Update, &e);
                let applied = self.mutate(|state| {
                    if !state.is_current(&scope) {
                        return false;
                    }
                    // 途中で削除されていれば戻す対象はない
                    if let Some(item) = state.find_mut(id) {
                        item.completed = previous;
                    }
                    state.error = Some(app_error.clone());
                    true
                });
                if applied {
                    record_app_error(&app_error, "toggle");
                }
                Err(app_error)
            }
        }
    }

    /// 即時に取り除き、失敗したら全件を再取得して整合させる
    pub async fn remove(&self, id: &TodoId) -> Result<(), AppError> {
        let prepared = self.mutate(|state| -> Result<Scope, AppError> {
            let scope = state.scope().ok_or(AppError::NotSignedIn)?;
            if id.is_temporary() {
                return Err(AppError::Validation(format!("Todo {id} is still being saved")));
            }
            state
                .remove(id)
                .ok_or_else(|| AppError::Validation(format!("Todo not found: {id}")))?;
            Ok(scope)
        });
        let scope = match prepared {
            Ok(scope) => scope,
            Err(e) => {
                self.report(e.clone());
                return Err(e);
            }
        };

        let filter = RowFilter::row(id.clone(), scope.owner_id.clone());
        let result = trace_remote_operation(
            "delete",
            Some(scope.owner_id.as_str()),
            self.table.delete(&filter),
        )
        .await;

        let Err(e) = result else {
            return Ok(());
        };

        let app_error = AppError::write(WriteOperation::Delete, &e);
        if !self.is_current(&scope) {
            debug!(todo_id = %id, "スコープが切り替わったため削除失敗を破棄しました");
            return Err(app_error);
        }

        // 取り除いた1件を戻さず、他セッションの変更も含めて再同期する
        if let Err(reload_error) = self.load_all(&scope.owner_id).await {
            warn!(error = %reload_error, "削除失敗後の再同期に失敗しました");
        }

        let applied = self.mutate(|state| {
            if !state.is_current(&scope) {
                return false;
            }
            state.error = Some(app_error.clone());
            true
        });
        if applied {
            record_app_error(&app_error, "remove");
        }
        Err(app_error)
    }

    fn is_current(&self, scope: &Scope) -> bool {
        self.state().is_current(scope)
    }

    /// ライブフィードの挿入を反映する（同じIDは置き換え）
    pub fn apply_remote_insert(&self, item: TodoItem) {
        self.mutate(|state| {
            if !state.accepts(&item) {
                warn!(todo_id = %item.id, "スコープ外の挿入を無視しました");
                return;
            }
            state.upsert_remote(item);
        });
    }

    /// ライブフィードの更新を反映する（未知のIDは無視）
    pub fn apply_remote_update(&self, item: TodoItem) {
        self.mutate(|state| {
            if !state.accepts(&item) {
                warn!(todo_id = %item.id, "スコープ外の更新を無視しました");
                return;
            }
            let todo_id = item.id.clone();
            if !state.update_remote(item) {
                debug!(todo_id = %todo_id, "未知のIDへの更新を無視しました");
            }
        });
    }

    /// ライブフィードの削除を反映する（未知のIDは何もしない）
    pub fn apply_remote_delete(&self, id: &TodoId) {
        self.mutate(|state| {
            if state.remove(id).is_none() {
                debug!(todo_id = %id, "未知のIDへの削除を無視しました");
            }
        });
    }

    /// 購読中の所有者宛ての変更通知を振り分ける
    pub fn apply_change(&self, owner_id: &UserId, event: ChangeEvent) {
        if self.owner_id().as_ref() != Some(owner_id) {
            debug!(owner_id = %owner_id, kind = %event.kind(), "現在のスコープ外の通知を破棄しました");
            return;
        }
        if let Err(e) = event.validate_owner(owner_id) {
            warn!(error = %e, "所有者の異なる変更通知を破棄しました");
            return;
        }

        match event {
            ChangeEvent::Insert { record } => self.apply_remote_insert(record),
            ChangeEvent::Update { record } => self.apply_remote_update(record),
            ChangeEvent::Delete { id } => self.apply_remote_delete(&id),
        }
    }

    /// エラーをバナーに出す（直近の1件のみ保持）
    pub fn report(&self, error: AppError) {
        record_app_error(&error, "report");
        self.mutate(|state| state.error = Some(error));
    }

    pub fn dismiss_error(&self) {
        self.mutate(|state| state.error = None);
    }
}
