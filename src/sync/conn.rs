//! Synchronous PostgreSQL connection.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::buffer_pool::PooledBufferSet;
use crate::conversion::{DecodedValue, ToParams, TypeRegistry, TypeParser};
use crate::error::{Error, Result};
use crate::handler::{
    AsyncMessageHandler, BinaryHandler, DropHandler, DynamicHandler, FirstRowHandler, TextHandler,
};
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::{FormatCode, Oid, TransactionStatus};
use crate::state::StateMachine;
use crate::state::action::Action;
use crate::state::connection::ConnectionStateMachine;
use crate::state::extended::{BindStateMachine, ExtendedQueryStateMachine, PreparedStatement};
use crate::state::simple_query::SimpleQueryStateMachine;
use crate::statement::IntoStatement;

use super::stream::Stream;

/// Synchronous PostgreSQL connection.
pub struct Conn {
    pub(crate) stream: Stream,
    pub(crate) buffer_set: PooledBufferSet,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) is_broken: bool,
    name_counter: u64,
    async_message_handler: Option<Box<dyn AsyncMessageHandler>>,
    query_timeout: Option<Duration>,
    type_registry: TypeRegistry,
    host: String,
    port: u16,
    socket: Option<String>,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;

        let stream = if let Some(socket_path) = opts.resolved_socket_path() {
            Stream::unix(UnixStream::connect(&socket_path)?)
        } else {
            if opts.host.is_empty() {
                return Err(Error::InvalidUsage("host is empty".into()));
            }
            let addr = format!("{}:{}", opts.host, opts.port);
            let tcp = if let Some(timeout) = opts.connect_timeout {
                use std::net::ToSocketAddrs;
                let mut last_err = None;
                let mut connected = None;
                for socket_addr in addr.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&socket_addr, timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                connected
                    .ok_or_else(|| last_err.unwrap_or_else(|| std::io::Error::other("could not resolve address")))?
            } else {
                TcpStream::connect(&addr)?
            };
            tcp.set_nodelay(true)?;
            Stream::tcp(tcp)
        };

        Self::new_with_stream(stream, opts)
    }

    /// Connect using an existing stream.
    #[allow(unused_mut)]
    pub fn new_with_stream(mut stream: Stream, options: Opts) -> Result<Self> {
        let mut buffer_set = options.buffer_pool.get_buffer_set();
        let mut state_machine = ConnectionStateMachine::new(options.clone());

        if options.connect_timeout.is_some() {
            stream.set_read_timeout(options.connect_timeout)?;
        }

        let result = (|| -> Result<()> {
            loop {
                match state_machine.step(&mut buffer_set)? {
                    Action::WriteAndReadByte => {
                        stream.write_all(&buffer_set.write_buffer)?;
                        stream.flush()?;
                        let byte = stream.read_u8()?;
                        state_machine.set_ssl_response(byte);
                    }
                    Action::ReadMessage => {
                        stream.read_message(&mut buffer_set)?;
                    }
                    Action::Write => {
                        stream.write_all(&buffer_set.write_buffer)?;
                        stream.flush()?;
                    }
                    Action::WriteAndReadMessage => {
                        stream.write_all(&buffer_set.write_buffer)?;
                        stream.flush()?;
                        stream.read_message(&mut buffer_set)?;
                    }
                    Action::TlsHandshake => {
                        #[cfg(feature = "sync-tls")]
                        {
                            stream = stream.upgrade_to_tls(&options.host)?;
                        }
                        #[cfg(not(feature = "sync-tls"))]
                        {
                            return Err(Error::Unsupported(
                                "TLS requested but sync-tls feature not enabled".into(),
                            ));
                        }
                    }
                    Action::HandleAsyncMessageAndReadMessage(_) => {
                        // Ignore async messages during startup, read next message
                        stream.read_message(&mut buffer_set)?;
                    }
                    Action::Finished => break,
                }
            }
            Ok(())
        })();

        if options.connect_timeout.is_some() {
            stream.set_read_timeout(None)?;
        }
        result.map_err(|e| translate_timeout(e, options.connect_timeout.is_some()))?;

        let conn = Self {
            stream,
            buffer_set,
            backend_key: state_machine.backend_key().cloned(),
            server_params: state_machine.take_server_params(),
            transaction_status: state_machine.transaction_status(),
            is_broken: false,
            name_counter: 0,
            async_message_handler: None,
            query_timeout: options.query_timeout,
            type_registry: TypeRegistry::new(),
            host: options.host.clone(),
            port: options.port,
            socket: options.resolved_socket_path(),
        };

        // Upgrade to Unix socket if connected via TCP to loopback
        let conn = if options.prefer_unix_socket && conn.stream.is_tcp_loopback() {
            conn.try_upgrade_to_unix_socket(&options)
        } else {
            conn
        };

        Ok(conn)
    }

    /// Try to upgrade to Unix socket connection.
    /// Returns upgraded conn on success, original conn on failure.
    fn try_upgrade_to_unix_socket(mut self, opts: &Opts) -> Self {
        let mut handler = FirstRowHandler::<(String,)>::new();
        if self
            .query("SHOW unix_socket_directories", &mut handler)
            .is_err()
        {
            return self;
        }

        let socket_dir = match handler.into_row() {
            Some((dirs,)) => match dirs.split(',').next() {
                Some(d) if !d.trim().is_empty() => d.trim().to_string(),
                _ => return self,
            },
            None => return self,
        };

        let socket_path = format!("{}/.s.PGSQL.{}", socket_dir, opts.port);

        let unix_stream = match UnixStream::connect(&socket_path) {
            Ok(s) => s,
            Err(_) => return self,
        };

        let mut opts_unix = opts.clone();
        opts_unix.prefer_unix_socket = false;

        match Self::new_with_stream(Stream::unix(unix_stream), opts_unix) {
            Ok(new_conn) => new_conn,
            Err(_) => self,
        }
    }

    /// Get the backend key data for query cancellation.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get the connection ID (backend process ID).
    ///
    /// Returns 0 if the backend key data is not available.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if currently in a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// Generate the next unique portal name.
    pub(crate) fn next_portal_name(&mut self) -> String {
        self.name_counter += 1;
        format!("_zero_p_{}", self.name_counter)
    }

    /// Create a named portal by binding a statement.
    ///
    /// Used internally by Transaction::exec_portal.
    pub(crate) fn create_named_portal<S: IntoStatement, P: ToParams>(
        &mut self,
        portal_name: &str,
        statement: &S,
        params: &P,
    ) -> Result<()> {
        let mut state_machine = if let Some(sql) = statement.as_sql() {
            BindStateMachine::bind_sql(&mut self.buffer_set, portal_name, sql, params)?
        } else {
            let stmt = statement.as_prepared().unwrap();
            BindStateMachine::bind_prepared(
                &mut self.buffer_set,
                portal_name,
                &stmt.wire_name(),
                &stmt.param_oids,
                params,
            )?
        };

        loop {
            match state_machine.step(&mut self.buffer_set)? {
                Action::ReadMessage => {
                    self.stream.read_message(&mut self.buffer_set)?;
                }
                Action::Write => {
                    self.stream.write_all(&self.buffer_set.write_buffer)?;
                    self.stream.flush()?;
                }
                Action::WriteAndReadMessage => {
                    self.stream.write_all(&self.buffer_set.write_buffer)?;
                    self.stream.flush()?;
                    self.stream.read_message(&mut self.buffer_set)?;
                }
                Action::Finished => break,
                _ => return Err(Error::Protocol("Unexpected action in bind".into())),
            }
        }

        Ok(())
    }

    /// Set the async message handler.
    ///
    /// The handler is called when the server sends asynchronous messages:
    /// - `Notification` - from LISTEN/NOTIFY
    /// - `Notice` - warnings and informational messages
    /// - `ParameterChanged` - server parameter updates
    pub fn set_async_message_handler<H: AsyncMessageHandler + 'static>(&mut self, handler: H) {
        self.async_message_handler = Some(Box::new(handler));
    }

    /// Remove the async message handler.
    pub fn clear_async_message_handler(&mut self) {
        self.async_message_handler = None;
    }

    /// Register a session-local decoder for `(oid, format)`, overriding the
    /// global default for this connection only.
    pub fn set_type_parser<F>(&mut self, oid: Oid, format: FormatCode, parser: F)
    where
        F: Fn(&[u8]) -> Result<DecodedValue> + Send + Sync + 'static,
    {
        self.type_registry.set(oid, format, parser);
    }

    /// Look up the decoder that would run for `(oid, format)` on this
    /// connection: a session override if one is registered, else the global
    /// default, else `None`.
    pub fn get_type_parser(&self, oid: Oid, format: FormatCode) -> Option<TypeParser> {
        self.type_registry
            .get(oid, format)
            .or_else(|| crate::conversion::get_global_type_parser(oid, format))
    }

    /// Execute a simple query, decoding every column through the session's
    /// type-parser registry instead of a compile-time Rust type.
    pub fn query_dynamic(&mut self, sql: &str) -> Result<Vec<Vec<DecodedValue>>> {
        let mut handler = DynamicHandler::new(self.type_registry.clone());
        self.query(sql, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Execute a statement, decoding every column through the session's
    /// type-parser registry instead of a compile-time Rust type.
    ///
    /// The statement can be either a `&PreparedStatement` or a raw SQL `&str`.
    pub fn exec_dynamic<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Vec<Vec<DecodedValue>>> {
        let mut handler = DynamicHandler::new(self.type_registry.clone());
        self.exec(statement, params, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Ping the server with an empty query to check connection aliveness.
    pub fn ping(&mut self) -> Result<()> {
        self.query_drop("")?;
        Ok(())
    }

    /// Send a `CancelRequest` on a fresh connection, asking the server to abort
    /// whatever statement is currently executing on this connection.
    ///
    /// There is no confirmation: the server closes the cancel connection
    /// immediately without a response, and the original connection may finish
    /// the statement anyway if the cancel loses the race. Call this from a
    /// thread other than the one driving the connection being cancelled.
    pub fn cancel(&self) -> Result<()> {
        let Some(key) = self.backend_key else {
            return Err(Error::InvalidUsage(
                "no backend key data available to cancel".into(),
            ));
        };

        let mut cancel_stream = if let Some(socket_path) = &self.socket {
            Stream::unix(UnixStream::connect(socket_path)?)
        } else {
            Stream::tcp(TcpStream::connect((self.host.as_str(), self.port))?)
        };

        let mut buf = Vec::new();
        crate::protocol::frontend::write_cancel_request(&mut buf, key.process_id(), key.secret());
        cancel_stream.write_all(&buf)?;
        cancel_stream.flush()?;
        Ok(())
    }

    /// Drive a state machine to completion, bounding the wait on `timeout` if
    /// given, falling back to the connection's default `query_timeout`
    /// otherwise.
    ///
    /// A client-side timeout does not poison the connection: the server may
    /// still be executing the abandoned statement, so on timeout this drains
    /// whatever it eventually sends up to the matching `ReadyForQuery` before
    /// returning `Error::QueryTimeout`, leaving the session ready for the next
    /// query.
    fn drive<S: StateMachine>(&mut self, state_machine: &mut S, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.or(self.query_timeout);

        if let Some(timeout) = timeout {
            self.stream.set_read_timeout(Some(timeout))?;
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let result = (|| -> Result<()> {
            loop {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    return Err(Error::QueryTimeout);
                }
                match state_machine.step(&mut self.buffer_set)? {
                    Action::WriteAndReadByte => {
                        return Err(Error::Protocol(
                            "Unexpected WriteAndReadByte in query state machine".into(),
                        ));
                    }
                    Action::ReadMessage => {
                        self.stream.read_message(&mut self.buffer_set)?;
                    }
                    Action::Write => {
                        self.stream.write_all(&self.buffer_set.write_buffer)?;
                        self.stream.flush()?;
                    }
                    Action::WriteAndReadMessage => {
                        self.stream.write_all(&self.buffer_set.write_buffer)?;
                        self.stream.flush()?;
                        self.stream.read_message(&mut self.buffer_set)?;
                    }
                    Action::TlsHandshake => {
                        return Err(Error::Protocol(
                            "Unexpected TlsHandshake in query state machine".into(),
                        ));
                    }
                    Action::HandleAsyncMessageAndReadMessage(ref async_msg) => {
                        if let Some(ref mut h) = self.async_message_handler {
                            h.handle(async_msg);
                        }
                        self.stream.read_message(&mut self.buffer_set)?;
                    }
                    Action::Finished => {
                        self.transaction_status = state_machine.transaction_status();
                        break;
                    }
                }
            }
            Ok(())
        })();

        if timeout.is_some() {
            self.stream.set_read_timeout(None)?;
        }
        let result = result.map_err(|e| translate_timeout(e, timeout.is_some()));

        if matches!(result, Err(Error::QueryTimeout)) {
            self.drain_to_ready_for_query();
        }

        result
    }

    /// After a client-side read timeout abandons the in-flight query, keep
    /// reading messages (ignoring their content) until the server's matching
    /// `ReadyForQuery` arrives, so the session is queryable again. A socket
    /// error while draining means the connection really is unusable.
    fn drain_to_ready_for_query(&mut self) {
        use crate::protocol::backend::{ReadyForQuery, msg_type};

        loop {
            match self.stream.read_message(&mut self.buffer_set) {
                Ok(()) => {
                    if self.buffer_set.type_byte == msg_type::READY_FOR_QUERY {
                        if let Ok(ready) = ReadyForQuery::parse(&self.buffer_set.read_buffer) {
                            self.transaction_status = ready.transaction_status().unwrap_or_default();
                        }
                        return;
                    }
                }
                Err(_) => {
                    self.is_broken = true;
                    return;
                }
            }
        }
    }

    /// Execute a simple query with a handler.
    pub fn query<H: TextHandler>(&mut self, sql: &str, handler: &mut H) -> Result<()> {
        self.query_timed(sql, handler, None)
    }

    /// Execute a simple query with a handler, using `timeout` as this one
    /// query's client-side read deadline instead of the connection's default
    /// `query_timeout`.
    pub fn query_with_timeout<H: TextHandler>(
        &mut self,
        sql: &str,
        timeout: Duration,
        handler: &mut H,
    ) -> Result<()> {
        self.query_timed(sql, handler, Some(timeout))
    }

    fn query_timed<H: TextHandler>(
        &mut self,
        sql: &str,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let result = self.query_inner(sql, handler, timeout);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn query_inner<H: TextHandler>(
        &mut self,
        sql: &str,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut state_machine = SimpleQueryStateMachine::new(handler, sql);
        self.drive(&mut state_machine, timeout)
    }

    /// Execute a simple query and discard results.
    pub fn query_drop(&mut self, sql: &str) -> Result<Option<u64>> {
        let mut handler = DropHandler::new();
        self.query(sql, &mut handler)?;
        Ok(handler.rows_affected())
    }

    /// Execute a simple query and collect typed rows.
    pub fn query_collect<T: for<'a> crate::conversion::FromRow<'a>>(
        &mut self,
        sql: &str,
    ) -> Result<Vec<T>> {
        let mut handler = crate::handler::CollectHandler::<T>::new();
        self.query(sql, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Execute a simple query with a per-query timeout and collect typed rows.
    pub fn query_collect_with_timeout<T: for<'a> crate::conversion::FromRow<'a>>(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Vec<T>> {
        let mut handler = crate::handler::CollectHandler::<T>::new();
        self.query_with_timeout(sql, timeout, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Execute a simple query and return the first typed row.
    pub fn query_first<T: for<'a> crate::conversion::FromRow<'a>>(
        &mut self,
        sql: &str,
    ) -> Result<Option<T>> {
        let mut handler = crate::handler::FirstRowHandler::<T>::new();
        self.query(sql, &mut handler)?;
        Ok(handler.into_row())
    }

    /// Close the connection gracefully.
    pub fn close(mut self) -> Result<()> {
        self.buffer_set.write_buffer.clear();
        write_terminate(&mut self.buffer_set.write_buffer);
        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;
        Ok(())
    }

    // === Extended Query Protocol ===

    /// Prepare a statement using the extended query protocol.
    pub fn prepare(&mut self, query: &str) -> Result<PreparedStatement> {
        self.prepare_typed(query, &[])
    }

    /// Prepare a statement with explicit parameter types.
    pub fn prepare_typed(&mut self, query: &str, param_oids: &[u32]) -> Result<PreparedStatement> {
        self.name_counter += 1;
        let idx = self.name_counter;
        let result = self.prepare_inner(idx, query, param_oids);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn prepare_inner(
        &mut self,
        idx: u64,
        query: &str,
        param_oids: &[u32],
    ) -> Result<PreparedStatement> {
        let mut handler = DropHandler::new();
        let mut state_machine = ExtendedQueryStateMachine::prepare(
            &mut handler,
            &mut self.buffer_set,
            idx,
            query,
            param_oids,
        );
        self.drive(&mut state_machine, None)?;
        state_machine
            .take_prepared_statement()
            .ok_or_else(|| Error::Protocol("No prepared statement".into()))
    }

    /// Execute a statement with a handler.
    ///
    /// The statement can be either:
    /// - A `&PreparedStatement` returned from `prepare()`
    /// - A raw SQL `&str` for one-shot execution
    pub fn exec<S: IntoStatement, P: ToParams, H: BinaryHandler>(
        &mut self,
        statement: S,
        params: P,
        handler: &mut H,
    ) -> Result<()> {
        self.exec_timed(statement, params, handler, None)
    }

    /// Execute a statement with a handler, using `timeout` as this one
    /// query's client-side read deadline instead of the connection's default
    /// `query_timeout`.
    ///
    /// The statement can be either a `&PreparedStatement` or a raw SQL `&str`.
    pub fn exec_with_timeout<S: IntoStatement, P: ToParams, H: BinaryHandler>(
        &mut self,
        statement: S,
        params: P,
        timeout: Duration,
        handler: &mut H,
    ) -> Result<()> {
        self.exec_timed(statement, params, handler, Some(timeout))
    }

    fn exec_timed<S: IntoStatement, P: ToParams, H: BinaryHandler>(
        &mut self,
        statement: S,
        params: P,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let result = self.exec_inner(&statement, &params, handler, timeout);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn exec_inner<S: IntoStatement, P: ToParams, H: BinaryHandler>(
        &mut self,
        statement: &S,
        params: &P,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut state_machine = if statement.needs_parse() {
            ExtendedQueryStateMachine::execute_sql(
                handler,
                &mut self.buffer_set,
                statement.as_sql().unwrap(),
                params,
            )?
        } else {
            let stmt = statement.as_prepared().unwrap();
            ExtendedQueryStateMachine::execute(
                handler,
                &mut self.buffer_set,
                &stmt.wire_name(),
                &stmt.param_oids,
                params,
            )?
        };

        self.drive(&mut state_machine, timeout)
    }

    /// Execute a statement and discard results.
    ///
    /// The statement can be either a `&PreparedStatement` or a raw SQL `&str`.
    pub fn exec_drop<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Option<u64>> {
        let mut handler = DropHandler::new();
        self.exec(statement, params, &mut handler)?;
        Ok(handler.rows_affected())
    }

    /// Execute a statement and collect typed rows.
    ///
    /// The statement can be either a `&PreparedStatement` or a raw SQL `&str`.
    pub fn exec_collect<T: for<'a> crate::conversion::FromRow<'a>, S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Vec<T>> {
        let mut handler = crate::handler::CollectHandler::<T>::new();
        self.exec(statement, params, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Execute a statement with a per-query timeout and collect typed rows.
    ///
    /// The statement can be either a `&PreparedStatement` or a raw SQL `&str`.
    pub fn exec_collect_with_timeout<
        T: for<'a> crate::conversion::FromRow<'a>,
        S: IntoStatement,
        P: ToParams,
    >(
        &mut self,
        statement: S,
        params: P,
        timeout: Duration,
    ) -> Result<Vec<T>> {
        let mut handler = crate::handler::CollectHandler::<T>::new();
        self.exec_with_timeout(statement, params, timeout, &mut handler)?;
        Ok(handler.into_rows())
    }

    /// Execute a statement with multiple parameter sets in a batch.
    ///
    /// This is more efficient than calling `exec_drop` multiple times as it
    /// batches the network communication. The statement is parsed once (if raw SQL)
    /// and then bound/executed for each parameter set.
    ///
    /// Parameters are processed in chunks (default 1000) to avoid overwhelming
    /// the server with too many pending operations.
    ///
    /// The statement can be either:
    /// - A `&PreparedStatement` returned from `prepare()`
    /// - A raw SQL `&str` for one-shot execution
    pub fn exec_batch<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params_list: &[P],
    ) -> Result<()> {
        self.exec_batch_chunked(statement, params_list, 1000)
    }

    /// Execute a statement with multiple parameter sets in a batch with custom chunk size.
    ///
    /// Same as `exec_batch` but allows specifying the chunk size for batching.
    pub fn exec_batch_chunked<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params_list: &[P],
        chunk_size: usize,
    ) -> Result<()> {
        let result = self.exec_batch_inner(&statement, params_list, chunk_size);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn exec_batch_inner<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: &S,
        params_list: &[P],
        chunk_size: usize,
    ) -> Result<()> {
        use crate::protocol::frontend::{write_bind, write_execute, write_parse, write_sync};
        use crate::state::extended::BatchStateMachine;

        if params_list.is_empty() {
            return Ok(());
        }

        let chunk_size = chunk_size.max(1);
        let needs_parse = statement.needs_parse();
        let sql = statement.as_sql();
        let prepared = statement.as_prepared();

        let param_oids: Vec<u32> = if let Some(stmt) = prepared {
            stmt.param_oids.clone()
        } else {
            params_list[0].natural_oids()
        };

        let stmt_name = prepared.map(|s| s.wire_name()).unwrap_or_default();

        for chunk in params_list.chunks(chunk_size) {
            self.buffer_set.write_buffer.clear();

            let parse_in_chunk = needs_parse;
            if parse_in_chunk {
                write_parse(
                    &mut self.buffer_set.write_buffer,
                    "",
                    sql.unwrap(),
                    &param_oids,
                );
            }

            for params in chunk {
                let effective_stmt_name = if needs_parse { "" } else { &stmt_name };
                write_bind(
                    &mut self.buffer_set.write_buffer,
                    "",
                    effective_stmt_name,
                    params,
                    &param_oids,
                )?;
                write_execute(&mut self.buffer_set.write_buffer, "", 0);
            }

            write_sync(&mut self.buffer_set.write_buffer);

            let mut state_machine = BatchStateMachine::new(parse_in_chunk);
            self.drive_batch(&mut state_machine)?;
            self.transaction_status = state_machine.transaction_status();
        }

        Ok(())
    }

    /// Drive a batch state machine to completion.
    fn drive_batch(
        &mut self,
        state_machine: &mut crate::state::extended::BatchStateMachine,
    ) -> Result<()> {
        use crate::protocol::backend::{ReadyForQuery, msg_type};
        use crate::state::action::Action;

        loop {
            let step_result = state_machine.step(&mut self.buffer_set);
            match step_result {
                Ok(Action::ReadMessage) => {
                    self.stream.read_message(&mut self.buffer_set)?;
                }
                Ok(Action::WriteAndReadMessage) => {
                    self.stream.write_all(&self.buffer_set.write_buffer)?;
                    self.stream.flush()?;
                    self.stream.read_message(&mut self.buffer_set)?;
                }
                Ok(Action::Finished) => {
                    break;
                }
                Ok(_) => return Err(Error::Protocol("Unexpected action in batch".into())),
                Err(e) => {
                    loop {
                        self.stream.read_message(&mut self.buffer_set)?;
                        if self.buffer_set.type_byte == msg_type::READY_FOR_QUERY {
                            let ready = ReadyForQuery::parse(&self.buffer_set.read_buffer)?;
                            self.transaction_status = ready.transaction_status().unwrap_or_default();
                            break;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Close a prepared statement.
    pub fn close_statement(&mut self, stmt: &PreparedStatement) -> Result<()> {
        let result = self.close_statement_inner(&stmt.wire_name());
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn close_statement_inner(&mut self, name: &str) -> Result<()> {
        let mut handler = DropHandler::new();
        let mut state_machine =
            ExtendedQueryStateMachine::close_statement(&mut handler, &mut self.buffer_set, name);
        self.drive(&mut state_machine, None)
    }

    // === Low-Level Extended Query Protocol ===

    /// Low-level flush: send FLUSH to force server to send pending responses.
    ///
    /// Unlike SYNC, FLUSH does not end the transaction or wait for ReadyForQuery.
    /// It just forces the server to send any pending responses without ending
    /// the extended query sequence.
    pub fn lowlevel_flush(&mut self) -> Result<()> {
        use crate::protocol::frontend::write_flush;

        self.buffer_set.write_buffer.clear();
        write_flush(&mut self.buffer_set.write_buffer);

        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Low-level sync: send SYNC and receive ReadyForQuery.
    ///
    /// This ends an extended query sequence and:
    /// - Commits implicit transaction if successful
    /// - Rolls back implicit transaction if failed
    /// - Updates transaction status
    pub fn lowlevel_sync(&mut self) -> Result<()> {
        let result = self.lowlevel_sync_inner();
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn lowlevel_sync_inner(&mut self) -> Result<()> {
        use crate::protocol::backend::{ErrorResponse, RawMessage, ReadyForQuery, msg_type};
        use crate::protocol::frontend::write_sync;

        self.buffer_set.write_buffer.clear();
        write_sync(&mut self.buffer_set.write_buffer);

        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;

        let mut pending_error: Option<Error> = None;

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            let type_byte = self.buffer_set.type_byte;

            if RawMessage::is_async_type(type_byte) {
                continue;
            }

            match type_byte {
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&self.buffer_set.read_buffer)?;
                    self.transaction_status = ready.transaction_status().unwrap_or_default();
                    if let Some(e) = pending_error {
                        return Err(e);
                    }
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?;
                    pending_error = Some(error.into_error());
                }
                _ => {
                    // Ignore other messages before ReadyForQuery
                }
            }
        }
    }

    /// Low-level bind: send BIND message and receive BindComplete.
    ///
    /// This allows creating named portals. Unlike `exec()`, this does NOT
    /// send EXECUTE or SYNC - the caller controls when to execute and sync.
    ///
    /// # Arguments
    /// - `portal`: Portal name (empty string "" for unnamed portal)
    /// - `statement_name`: Prepared statement name
    /// - `params`: Parameter values
    pub fn lowlevel_bind<P: ToParams>(
        &mut self,
        portal: &str,
        statement_name: &str,
        params: P,
    ) -> Result<()> {
        let result = self.lowlevel_bind_inner(portal, statement_name, &params);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn lowlevel_bind_inner<P: ToParams>(
        &mut self,
        portal: &str,
        statement_name: &str,
        params: &P,
    ) -> Result<()> {
        use crate::protocol::backend::{BindComplete, ErrorResponse, RawMessage, msg_type};
        use crate::protocol::frontend::{write_bind, write_flush};

        let param_oids = params.natural_oids();
        self.buffer_set.write_buffer.clear();
        write_bind(
            &mut self.buffer_set.write_buffer,
            portal,
            statement_name,
            params,
            &param_oids,
        )?;
        write_flush(&mut self.buffer_set.write_buffer);

        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            let type_byte = self.buffer_set.type_byte;

            if RawMessage::is_async_type(type_byte) {
                continue;
            }

            match type_byte {
                msg_type::BIND_COMPLETE => {
                    BindComplete::parse(&self.buffer_set.read_buffer)?;
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?;
                    return Err(error.into_error());
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "Expected BindComplete or ErrorResponse, got '{}'",
                        type_byte as char
                    )));
                }
            }
        }
    }

    /// Low-level execute: send EXECUTE message and receive results.
    ///
    /// Executes a previously bound portal. Does NOT send SYNC.
    ///
    /// # Arguments
    /// - `portal`: Portal name (empty string "" for unnamed portal)
    /// - `max_rows`: Maximum rows to return (0 = unlimited)
    /// - `handler`: Handler to receive rows
    ///
    /// # Returns
    /// - `Ok(true)` if more rows available (PortalSuspended received)
    /// - `Ok(false)` if execution completed (CommandComplete received)
    pub fn lowlevel_execute<H: BinaryHandler>(
        &mut self,
        portal: &str,
        max_rows: u32,
        handler: &mut H,
    ) -> Result<bool> {
        let result = self.lowlevel_execute_inner(portal, max_rows, handler);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn lowlevel_execute_inner<H: BinaryHandler>(
        &mut self,
        portal: &str,
        max_rows: u32,
        handler: &mut H,
    ) -> Result<bool> {
        use crate::protocol::backend::{
            CommandComplete, DataRow, ErrorResponse, NoData, PortalSuspended, RawMessage,
            RowDescription, msg_type,
        };
        use crate::protocol::frontend::{write_describe_portal, write_execute, write_flush};

        self.buffer_set.write_buffer.clear();
        write_describe_portal(&mut self.buffer_set.write_buffer, portal);
        write_execute(&mut self.buffer_set.write_buffer, portal, max_rows);
        write_flush(&mut self.buffer_set.write_buffer);

        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;

        let mut column_buffer: Vec<u8> = Vec::new();

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            let type_byte = self.buffer_set.type_byte;

            if RawMessage::is_async_type(type_byte) {
                continue;
            }

            match type_byte {
                msg_type::ROW_DESCRIPTION => {
                    column_buffer.clear();
                    column_buffer.extend_from_slice(&self.buffer_set.read_buffer);
                    let cols = RowDescription::parse(&column_buffer)?;
                    handler.result_start(cols)?;
                }
                msg_type::NO_DATA => {
                    NoData::parse(&self.buffer_set.read_buffer)?;
                }
                msg_type::DATA_ROW => {
                    let cols = RowDescription::parse(&column_buffer)?;
                    let row = DataRow::parse(&self.buffer_set.read_buffer)?;
                    handler.row(cols, row)?;
                }
                msg_type::COMMAND_COMPLETE => {
                    let complete = CommandComplete::parse(&self.buffer_set.read_buffer)?;
                    handler.result_end(complete)?;
                    return Ok(false); // No more rows
                }
                msg_type::PORTAL_SUSPENDED => {
                    PortalSuspended::parse(&self.buffer_set.read_buffer)?;
                    return Ok(true); // More rows available
                }
                msg_type::ERROR_RESPONSE => {
                    let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?;
                    return Err(error.into_error());
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message in execute: '{}'",
                        type_byte as char
                    )));
                }
            }
        }
    }

    /// Low-level close portal: send Close(Portal) and receive CloseComplete.
    pub fn lowlevel_close_portal(&mut self, portal: &str) -> Result<()> {
        let result = self.lowlevel_close_portal_inner(portal);
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn lowlevel_close_portal_inner(&mut self, portal: &str) -> Result<()> {
        use crate::protocol::backend::{CloseComplete, ErrorResponse, RawMessage, msg_type};
        use crate::protocol::frontend::{write_close_portal, write_flush};

        self.buffer_set.write_buffer.clear();
        write_close_portal(&mut self.buffer_set.write_buffer, portal);
        write_flush(&mut self.buffer_set.write_buffer);

        self.stream.write_all(&self.buffer_set.write_buffer)?;
        self.stream.flush()?;

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            let type_byte = self.buffer_set.type_byte;

            if RawMessage::is_async_type(type_byte) {
                continue;
            }

            match type_byte {
                msg_type::CLOSE_COMPLETE => {
                    CloseComplete::parse(&self.buffer_set.read_buffer)?;
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?;
                    return Err(error.into_error());
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "Expected CloseComplete or ErrorResponse, got '{}'",
                        type_byte as char
                    )));
                }
            }
        }
    }

    /// Execute a closure within a transaction.
    ///
    /// If the closure returns `Ok`, the transaction is committed.
    /// If the closure returns `Err` or the transaction is not explicitly
    /// committed or rolled back, the transaction is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUsage` if called while already in a transaction.
    pub fn transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Conn, super::transaction::Transaction) -> Result<R>,
    {
        if self.in_transaction() {
            return Err(Error::InvalidUsage(
                "nested transactions are not supported".into(),
            ));
        }

        self.query_drop("BEGIN")?;

        let tx = super::transaction::Transaction::new(self.connection_id());

        let result = f(self, tx);

        if self.in_transaction() {
            let rollback_result = self.query_drop("ROLLBACK");

            if let Err(e) = result {
                return Err(e);
            }
            rollback_result?;
        }

        result
    }
}

/// Reinterpret a read-timeout expiry as `Error::QueryTimeout` rather than a bare I/O error,
/// but only when a deadline was actually armed for this call.
fn translate_timeout(err: Error, timeout_armed: bool) -> Error {
    if !timeout_armed {
        return err;
    }
    match &err {
        Error::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Error::QueryTimeout
        }
        _ => err,
    }
}
