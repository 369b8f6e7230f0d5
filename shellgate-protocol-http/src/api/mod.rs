mod active_sessions;
mod chat;
mod connections;
mod participants;
mod recordings;
mod sftp;
mod snippets;

use poem::{delete, get, post, Route};

pub fn routes() -> Route {
    Route::new()
        .at(
            "/active-sessions",
            get(active_sessions::list).post(active_sessions::launch),
        )
        .at(
            "/active-sessions/:id/participants",
            post(participants::add),
        )
        .at(
            "/active-sessions/:id/participants/:user_id",
            delete(participants::remove),
        )
        .at(
            "/active-sessions/:id/participants/:user_id/write",
            post(participants::grant_write).delete(participants::relinquish_write),
        )
        .at(
            "/active-sessions/:id/chat",
            get(chat::history).post(chat::post_message),
        )
        .at(
            "/active-sessions/:id/recording/status",
            get(recordings::status),
        )
        .at(
            "/active-sessions/:id/recording/stop",
            post(recordings::stop),
        )
        .at("/active-sessions/:id/snippet", post(snippets::execute))
        .at("/active-sessions/:id/sftp/list", get(sftp::list))
        .at("/active-sessions/:id/sftp/metadata", get(sftp::metadata))
        .at("/active-sessions/:id/sftp/read", get(sftp::read))
        .at("/active-sessions/:id/sftp/save", post(sftp::save))
        .at("/active-sessions/:id/sftp/upload", post(sftp::upload))
        .at("/active-sessions/:id/sftp/download", get(sftp::download))
        .at("/active-sessions/:id/sftp/rename", post(sftp::rename))
        .at("/active-sessions/:id/sftp/file", delete(sftp::delete_file))
        .at(
            "/active-sessions/:id/sftp/dir",
            post(sftp::create_dir).delete(sftp::delete_dir),
        )
        .at("/session-records", get(recordings::list))
        .at("/session-records/:record_id", delete(recordings::delete))
        .at(
            "/session-records/:record_id/download",
            get(recordings::download),
        )
        .at("/snippets", get(snippets::list).post(snippets::create))
        .at("/snippets/:id", delete(snippets::delete))
        .at("/connections", get(connections::list))
}
